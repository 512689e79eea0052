// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Parsing of Breakpad text-format symbol files.
//!
//! The format is line-oriented: every record is a single line, and the
//! first token identifies the record kind. Each line is parsed on its own,
//! so one bad record never poisons the rest of the file: the line is
//! dropped and the resulting [`SymbolFile`] is flagged corrupt.
//!
//! Two record kinds (`INLINE_ORIGIN` and `INLINE`) exist in an older and a
//! newer variant that can only be told apart by counting tokens, so those
//! two are parsed by explicit token splitting rather than by grammar.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1, hex_digit1, space1};
use nom::combinator::{map_res, opt, recognize, rest};
use nom::sequence::{pair, terminated};
use nom::IResult;
use tracing::debug;

use crate::range_map::RangeMap;
use crate::sym_file::types::*;
use crate::SymbolError;

/// Match a hex field, parse it to a u64.
fn hex_u64(input: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |s: &str| u64::from_str_radix(s, 16))(input)
}

/// Match a hex field, parse it to a u32.
fn hex_u32(input: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |s: &str| u32::from_str_radix(s, 16))(input)
}

/// Match an optionally-negated hex field. Parameter sizes use this so that
/// a negative value can be recognized and rejected rather than misparsed.
fn hex_i64(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), hex_digit1)), |s: &str| {
        i64::from_str_radix(s, 16)
    })(input)
}

/// Match an optionally-negated decimal field, parse it to an i64.
fn dec_i64(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i64>()
    })(input)
}

/// Match a decimal field that must fit a non-negative u32.
fn dec_u32(input: &str) -> IResult<&str, u32> {
    map_res(dec_i64, u32::try_from)(input)
}

/// The trailing name field: the rest of the line, embedded spaces retained,
/// surrounding whitespace trimmed. Must be non-empty.
fn name_field(input: &str) -> IResult<&str, &str> {
    map_res(rest, |s: &str| {
        let s = s.trim();
        if s.is_empty() {
            Err(MalformedRecord)
        } else {
            Ok(s)
        }
    })(input)
}

/// Marker error for field validation inside `map_res`.
#[derive(Debug)]
struct MalformedRecord;

/// Run `parser` over the whole line; partial parses are failures.
fn parse_all<'a, T>(
    parser: impl Fn(&'a str) -> IResult<&'a str, T>,
    line: &'a str,
) -> Option<T> {
    match parser(line) {
        Ok(("", value)) => Some(value),
        _ => None,
    }
}

/// A single whitespace-delimited token.
fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_ascii_whitespace())(input)
}

/// Matches a MODULE record: `MODULE <os> <cpu> <debug id> <name>`.
fn module_line(input: &str) -> IResult<&str, ModuleInfo> {
    let (input, _) = terminated(tag("MODULE"), space1)(input)?;
    let (input, os) = terminated(token, space1)(input)?;
    let (input, cpu) = terminated(token, space1)(input)?;
    let (input, debug_id) = terminated(hex_digit1, space1)(input)?;
    let (input, name) = name_field(input)?;
    Ok((
        input,
        ModuleInfo {
            os: os.to_string(),
            cpu: cpu.to_string(),
            debug_id: debug_id.to_string(),
            name: name.to_string(),
        },
    ))
}

/// Matches a FILE record: `FILE <id> <path>`.
fn file_line(input: &str) -> IResult<&str, (u32, &str)> {
    let (input, _) = terminated(tag("FILE"), space1)(input)?;
    let (input, id) = terminated(dec_u32, space1)(input)?;
    let (input, path) = name_field(input)?;
    Ok((input, (id, path)))
}

/// Matches a PUBLIC record: `PUBLIC [m ]<address> <parameter size> <name>`.
fn public_line(input: &str) -> IResult<&str, PublicSymbol> {
    let (input, _) = terminated(tag("PUBLIC"), space1)(input)?;
    let (input, multiple) = opt(terminated(tag("m"), space1))(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, parameter_size) = terminated(map_res(hex_i64, u32::try_from), space1)(input)?;
    let (input, name) = name_field(input)?;
    Ok((
        input,
        PublicSymbol {
            address,
            parameter_size,
            name: name.to_string(),
            multiple: multiple.is_some(),
        },
    ))
}

/// Matches a FUNC record: `FUNC [m ]<address> <size> <parameter size> <name>`.
fn func_line(input: &str) -> IResult<&str, Function> {
    let (input, _) = terminated(tag("FUNC"), space1)(input)?;
    let (input, multiple) = opt(terminated(tag("m"), space1))(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u64, space1)(input)?;
    let (input, parameter_size) = terminated(map_res(hex_i64, u32::try_from), space1)(input)?;
    let (input, name) = name_field(input)?;
    Ok((
        input,
        Function {
            address,
            size,
            parameter_size,
            name: name.to_string(),
            multiple: multiple.is_some(),
            lines: RangeMap::new(),
            inlines: Vec::new(),
        },
    ))
}

/// Matches a line record: `<address> <size> <line> <file id>`.
fn func_line_data(input: &str) -> IResult<&str, SourceLine> {
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u64, space1)(input)?;
    let (input, line) = terminated(dec_u32, space1)(input)?;
    let (input, file) = dec_u32(input)?;
    Ok((
        input,
        SourceLine {
            address,
            size,
            file,
            line,
        },
    ))
}

/// Matches a STACK WIN record.
fn stack_win_line(input: &str) -> IResult<&str, WindowsFrameInfo> {
    let (input, _) = terminated(tag("STACK WIN"), space1)(input)?;
    let (input, ty) = terminated(hex_u64, space1)(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u64, space1)(input)?;
    let (input, prologue_size) = terminated(hex_u32, space1)(input)?;
    let (input, epilogue_size) = terminated(hex_u32, space1)(input)?;
    let (input, parameter_size) = terminated(hex_u32, space1)(input)?;
    let (input, saved_register_size) = terminated(hex_u32, space1)(input)?;
    let (input, local_size) = terminated(hex_u32, space1)(input)?;
    let (input, max_stack_size) = terminated(hex_u32, space1)(input)?;
    let (input, has_program_string) =
        terminated(map_res(digit1, parse_bool_field), space1)(input)?;
    let (input, trailer) = name_field(input)?;
    let program_string_or_base_pointer = if has_program_string {
        WinStackThing::ProgramString(trailer.to_string())
    } else {
        WinStackThing::AllocatesBasePointer(trailer == "1")
    };
    let frame_type = match ty {
        0 => WindowsFrameType::Fpo,
        1 => WindowsFrameType::Trap,
        2 => WindowsFrameType::Tss,
        3 => WindowsFrameType::Standard,
        4 => WindowsFrameType::FrameData,
        _ => WindowsFrameType::Unknown,
    };
    Ok((
        input,
        WindowsFrameInfo {
            frame_type,
            address,
            size,
            prologue_size,
            epilogue_size,
            parameter_size,
            saved_register_size,
            local_size,
            max_stack_size,
            program_string_or_base_pointer,
        },
    ))
}

fn parse_bool_field(s: &str) -> Result<bool, MalformedRecord> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(MalformedRecord),
    }
}

/// Matches a STACK CFI INIT record.
fn stack_cfi_init_line(input: &str) -> IResult<&str, StackInfoCfi> {
    let (input, _) = terminated(tag("STACK CFI INIT"), space1)(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, size) = terminated(hex_u64, space1)(input)?;
    let (input, rules) = cfi_rules_field(input)?;
    Ok((
        input,
        StackInfoCfi {
            init: CfiRules { address, rules },
            size,
            add_rules: Vec::new(),
        },
    ))
}

/// Matches a STACK CFI delta record.
fn stack_cfi_delta_line(input: &str) -> IResult<&str, CfiRules> {
    let (input, _) = terminated(tag("STACK CFI"), space1)(input)?;
    let (input, address) = terminated(hex_u64, space1)(input)?;
    let (input, rules) = cfi_rules_field(input)?;
    Ok((input, CfiRules { address, rules }))
}

fn cfi_rules_field(input: &str) -> IResult<&str, Vec<(String, String)>> {
    map_res(rest, |s: &str| {
        parse_cfi_rules(s).ok_or(MalformedRecord)
    })(input)
}

/// Split a CFI rule string into its `NAME: EXPR` pairs, in order.
///
/// A name ends with `:`; the expression is everything up to the next name
/// or the end of the string. The string must start with a name, and every
/// name must have a non-empty expression.
fn parse_cfi_rules(input: &str) -> Option<Vec<(String, String)>> {
    let mut rules = Vec::new();
    let mut cur_name: Option<&str> = None;
    let mut expr: Vec<&str> = Vec::new();
    for token in input.split_ascii_whitespace() {
        if let Some(name) = token.strip_suffix(':') {
            if name.is_empty() {
                return None;
            }
            if let Some(prev) = cur_name.take() {
                if expr.is_empty() {
                    return None;
                }
                rules.push((prev.to_string(), expr.join(" ")));
                expr.clear();
            }
            cur_name = Some(name);
        } else {
            // The first token must be a name.
            cur_name.as_ref()?;
            expr.push(token);
        }
    }
    let name = cur_name?;
    if expr.is_empty() {
        return None;
    }
    rules.push((name.to_string(), expr.join(" ")));
    Some(rules)
}

/// Split the leading whitespace-delimited token off `s`.
fn split_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(|c: char| c.is_ascii_whitespace()) {
        Some(index) => Some((&s[..index], &s[index..])),
        None => Some((s, "")),
    }
}

/// Strictly parse a whole token as a signed decimal integer.
fn dec_token(token: &str) -> Option<i64> {
    let digits = token.strip_prefix('-').unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse::<i64>().ok()
}

/// Strictly parse a whole token as an unsigned hex integer.
fn hex_token(token: &str) -> Option<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(token, 16).ok()
}

fn dec_token_u32(token: &str) -> Option<u32> {
    u32::try_from(dec_token(token)?).ok()
}

/// Matches an INLINE_ORIGIN record, in either variant:
///
/// `INLINE_ORIGIN <origin id> <file id> <name>` (older), where the file id
/// may be `-1` for an artificial function, or
/// `INLINE_ORIGIN <origin id> <name>` (newer).
///
/// It is the older form iff the token after the origin id parses as an
/// integer and at least one more token follows it.
fn inline_origin_line(input: &str) -> Option<(u32, InlineOrigin)> {
    let input = input.strip_prefix("INLINE_ORIGIN ")?;
    let (id_token, input) = split_token(input)?;
    let origin_id = dec_token_u32(id_token)?;
    let (second, after) = split_token(input)?;
    let name_after_file = after.trim();
    if let Some(file_id) = dec_token(second) {
        if !name_after_file.is_empty() {
            let file_id = match file_id {
                -1 => None,
                id => Some(u32::try_from(id).ok()?),
            };
            return Some((
                origin_id,
                InlineOrigin {
                    file_id,
                    name: name_after_file.to_string(),
                },
            ));
        }
    }
    Some((
        origin_id,
        InlineOrigin {
            file_id: None,
            name: input.trim().to_string(),
        },
    ))
}

/// Matches an INLINE record, in either variant:
///
/// `INLINE <nest level> <call site line> <origin id> (<address> <size>)+`
/// (older), or
/// `INLINE <nest level> <call site line> <call site file id> <origin id>
/// (<address> <size>)+` (newer).
///
/// The newer form has one extra integer, so the total token count is even
/// exactly when the call site file id is present.
fn inline_line(input: &str) -> Option<Inline> {
    let input = input.strip_prefix("INLINE ")?;
    let tokens: Vec<&str> = input.split_ascii_whitespace().collect();
    // The shortest valid record is the older form with one range.
    if tokens.len() < 5 {
        return None;
    }
    let has_call_site_file = tokens.len() % 2 == 0;
    let mut fields = tokens.iter();
    let nest_level = dec_token_u32(fields.next()?)?;
    let call_site_line = dec_token_u32(fields.next()?)?;
    let call_site_file = if has_call_site_file {
        Some(dec_token_u32(fields.next()?)?)
    } else {
        None
    };
    let origin_id = dec_token_u32(fields.next()?)?;
    let mut ranges = Vec::new();
    while let Some(address) = fields.next() {
        let size = fields.next()?;
        ranges.push((hex_token(address)?, hex_token(size)?));
    }
    if ranges.is_empty() {
        return None;
    }
    Some(Inline {
        nest_level,
        call_site_line,
        call_site_file,
        origin_id,
        ranges,
    })
}

/// Whether a line starts with an unrecognized record keyword.
///
/// Such lines (INFO and anything newer tools may emit) are skipped without
/// flagging the module, for forward compatibility.
fn is_unknown_keyword_line(line: &str) -> bool {
    let keyword = line
        .split_ascii_whitespace()
        .next()
        .unwrap_or("");
    !keyword.is_empty()
        && keyword
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b == b'_')
        && !keyword.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Incremental builder assembling parsed records into a [`SymbolFile`].
///
/// Line records attach to the most recent FUNC, CFI deltas to the most
/// recent STACK CFI INIT; both are inserted into their maps when the next
/// sibling record (or the end of input) closes them.
#[derive(Default)]
pub struct SymbolParser {
    module_info: Option<ModuleInfo>,
    files: HashMap<u32, String>,
    inline_origins: HashMap<u32, InlineOrigin>,
    publics: Vec<PublicSymbol>,
    functions: RangeMap<Function>,
    cfi_stack_info: RangeMap<StackInfoCfi>,
    win_stack_info: RangeMap<WindowsFrameInfo>,
    cur_function: Option<Function>,
    cur_cfi: Option<StackInfoCfi>,
    line_number: u64,
    seen_record: bool,
    corrupt: bool,
}

impl SymbolParser {
    pub fn new() -> SymbolParser {
        SymbolParser::default()
    }

    /// Record a rejected line: drop it and flag the module.
    fn reject(&mut self, what: &str) {
        debug!(
            "dropping malformed {} record at line {}",
            what, self.line_number
        );
        self.corrupt = true;
    }

    /// Parse one line of a symbol file. Never fails; bad records set the
    /// corrupt flag and are dropped.
    pub fn parse_line(&mut self, line: &str) {
        self.line_number += 1;
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        if line.starts_with("MODULE ") {
            if !self.seen_record {
                match parse_all(module_line, line) {
                    Some(info) => self.module_info = Some(info),
                    None => self.reject("MODULE"),
                }
            } else {
                // The header is only valid as the first record.
                self.reject("MODULE");
            }
        } else if line.starts_with("FILE ") {
            match parse_all(file_line, line) {
                Some((id, path)) => {
                    self.files.insert(id, path.to_string());
                }
                None => self.reject("FILE"),
            }
        } else if line.starts_with("INLINE_ORIGIN ") {
            match inline_origin_line(line) {
                Some((id, origin)) => {
                    self.inline_origins.insert(id, origin);
                }
                None => self.reject("INLINE_ORIGIN"),
            }
        } else if line.starts_with("INLINE ") {
            match inline_line(line) {
                Some(inline) => self.add_inline(inline),
                None => self.reject("INLINE"),
            }
        } else if line.starts_with("FUNC ") {
            match parse_all(func_line, line) {
                Some(function) => {
                    self.finish_function();
                    self.cur_function = Some(function);
                }
                None => self.reject("FUNC"),
            }
        } else if line.starts_with("PUBLIC ") {
            match parse_all(public_line, line) {
                Some(public) => self.publics.push(public),
                None => self.reject("PUBLIC"),
            }
        } else if line.starts_with("STACK WIN ") {
            match parse_all(stack_win_line, line) {
                // Overlapping WIN unwind records are endemic in converted
                // PDB data; keep the first and drop the rest quietly.
                Some(info) => {
                    let _ = self.win_stack_info.insert(info.memory_range(), info);
                }
                None => self.reject("STACK WIN"),
            }
        } else if line.starts_with("STACK CFI INIT ") {
            match parse_all(stack_cfi_init_line, line) {
                Some(cfi) => {
                    self.finish_cfi();
                    self.cur_cfi = Some(cfi);
                }
                None => self.reject("STACK CFI INIT"),
            }
        } else if line.starts_with("STACK CFI ") {
            match parse_all(stack_cfi_delta_line, line) {
                Some(delta) => self.add_cfi_delta(delta),
                None => self.reject("STACK CFI"),
            }
        } else if line.starts_with("STACK ") {
            // Some other flavor of unwind record; skip it.
        } else if let Some(source_line) = parse_all(func_line_data, line) {
            self.add_source_line(source_line);
        } else if is_unknown_keyword_line(line) {
            // A record type from the future; skip it.
        } else {
            self.reject("line");
        }

        self.seen_record = true;
    }

    fn add_source_line(&mut self, line: SourceLine) {
        if self.cur_function.is_none() {
            self.reject("line (outside any function)");
            return;
        }
        if !self.files.contains_key(&line.file) {
            self.reject("line (unknown file id)");
            return;
        }
        // PDB conversions produce zero-sized line entries; they can never
        // match a lookup, so drop them without complaint.
        if line.size == 0 {
            return;
        }
        let inserted = match self.cur_function.as_mut() {
            Some(func) => {
                let func_end = func.address.saturating_add(func.size);
                let line_end = line.address.checked_add(line.size);
                let contained = func.size == 0
                    || (line.address >= func.address
                        && line_end.map_or(false, |end| end <= func_end));
                contained
                    && func
                        .lines
                        .insert((line.address, line.size), line)
                        .is_ok()
            }
            None => false,
        };
        if !inserted {
            self.reject("line (outside its function)");
        }
    }

    fn add_inline(&mut self, inline: Inline) {
        if !self.inline_origins.contains_key(&inline.origin_id) {
            self.reject("INLINE (unknown origin id)");
            return;
        }
        if let Some(file) = inline.call_site_file {
            if !self.files.contains_key(&file) {
                self.reject("INLINE (unknown call site file id)");
                return;
            }
        }
        match self.cur_function.as_mut() {
            Some(func) => func.inlines.push(inline),
            None => self.reject("INLINE (outside any function)"),
        }
    }

    fn add_cfi_delta(&mut self, delta: CfiRules) {
        let in_range = match self.cur_cfi.as_ref() {
            Some(cfi) => {
                delta.address >= cfi.init.address
                    && delta.address - cfi.init.address < cfi.size
            }
            None => false,
        };
        if in_range {
            if let Some(cfi) = self.cur_cfi.as_mut() {
                cfi.add_rules.push(delta);
            }
        } else {
            self.reject("STACK CFI (no covering STACK CFI INIT)");
        }
    }

    fn finish_function(&mut self) {
        if let Some(function) = self.cur_function.take() {
            let range = function.memory_range();
            if self.functions.insert(range, function).is_err() {
                // Keep the first of two functions claiming the same code.
                debug!(
                    "dropping function overlapping an earlier one at {:#x}",
                    range.0
                );
                self.corrupt = true;
            }
        }
    }

    fn finish_cfi(&mut self) {
        if let Some(mut cfi) = self.cur_cfi.take() {
            cfi.add_rules.sort();
            let range = cfi.memory_range();
            if self.cfi_stack_info.insert(range, cfi).is_err() {
                debug!(
                    "dropping CFI unwind info overlapping an earlier range at {:#x}",
                    range.0
                );
                self.corrupt = true;
            }
        }
    }

    /// Close any open records and produce the finished [`SymbolFile`].
    pub fn finish(mut self) -> SymbolFile {
        self.finish_function();
        self.finish_cfi();
        self.publics.sort();
        SymbolFile {
            module_info: self.module_info,
            files: self.files,
            inline_origins: self.inline_origins,
            publics: self.publics,
            functions: self.functions,
            cfi_stack_info: self.cfi_stack_info,
            win_stack_info: self.win_stack_info,
            corrupt: self.corrupt,
        }
    }
}

/// Parse a `SymbolFile` from `bytes`.
pub fn parse_symbol_bytes(bytes: &[u8]) -> SymbolFile {
    let text = String::from_utf8_lossy(bytes);
    let mut parser = SymbolParser::new();
    for line in text.lines() {
        parser.parse_line(line);
    }
    parser.finish()
}

/// Parse a `SymbolFile` from the file at `path`.
pub fn parse_symbol_file(path: &Path) -> Result<SymbolFile, SymbolError> {
    let mut f = File::open(path)?;
    let mut bytes = vec![];
    f.read_to_end(&mut bytes)?;
    Ok(parse_symbol_bytes(&bytes))
}
