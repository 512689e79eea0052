// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::{self, Write};

use crate::range_map::RangeMap;

/// The header of a symbol file, from its MODULE record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// The operating system the module was built for.
    pub os: String,
    /// The CPU architecture.
    pub cpu: String,
    /// The debug identifier, as a hex string.
    pub debug_id: String,
    /// The module name.
    pub name: String,
}

/// A publicly visible linker symbol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicSymbol {
    /// The symbol's address relative to the module's load address.
    pub address: u64,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the symbol.
    pub name: String,
    /// Whether multiple symbols collapsed into this one.
    pub multiple: bool,
}

impl Ord for PublicSymbol {
    fn cmp(&self, other: &PublicSymbol) -> Ordering {
        let o = self.address.cmp(&other.address);
        if o != Ordering::Equal {
            o
        } else {
            // Fall back to sorting by name if addresses are equal.
            let nameo = self.name.cmp(&other.name);
            if nameo != Ordering::Equal {
                nameo
            } else {
                // Compare parameter size just for sanity.
                self.parameter_size.cmp(&other.parameter_size)
            }
        }
    }
}

impl PartialOrd for PublicSymbol {
    fn partial_cmp(&self, other: &PublicSymbol) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A mapping from machine code bytes to source line and file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// The start address relative to the module's load address.
    pub address: u64,
    /// The size of this range of instructions in bytes.
    pub size: u64,
    /// The source file that generated this machine code.
    ///
    /// This is an index into `SymbolFile::files`.
    pub file: u32,
    /// The line number in `file` that generated this machine code.
    pub line: u32,
}

/// A function that was inlined into another function.
///
/// One inline may cover several disjoint instruction ranges when the
/// compiler split the inlined body up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inline {
    /// How deeply this inline is nested inside its function, starting at 0.
    pub nest_level: u32,
    /// The source line of the call site.
    pub call_site_line: u32,
    /// The source file of the call site.
    ///
    /// Only present in the newer symbol format; older files attribute call
    /// sites to the surrounding line record's file.
    pub call_site_file: Option<u32>,
    /// The logical function that was inlined here.
    ///
    /// This is an index into `SymbolFile::inline_origins`.
    pub origin_id: u32,
    /// The `(address, size)` instruction ranges covered by this inline.
    pub ranges: Vec<(u64, u64)>,
}

impl Inline {
    /// The start of the range containing `addr`, if any.
    pub fn range_base(&self, addr: u64) -> Option<u64> {
        self.ranges
            .iter()
            .find(|&&(start, size)| addr >= start && addr - start < size)
            .map(|&(start, _)| start)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range_base(addr).is_some()
    }
}

/// The logical function an inline record refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineOrigin {
    /// The source file the function was defined in, when known.
    ///
    /// Only the older symbol format carries this; `-1` in the input (an
    /// artificial function) is represented as `None`.
    pub file_id: Option<u32>,
    /// The name of the function.
    pub name: String,
}

/// A source-language function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Function {
    /// The function's start address relative to the module's load address.
    pub address: u64,
    /// The size of the function in bytes.
    pub size: u64,
    /// The size of parameters passed to the function.
    pub parameter_size: u32,
    /// The name of the function as declared in the source.
    pub name: String,
    /// Whether multiple symbols collapsed into this one.
    pub multiple: bool,
    /// Source line information for this function.
    pub lines: RangeMap<SourceLine>,
    /// Functions inlined into this one, in record order.
    pub inlines: Vec<Inline>,
}

impl Function {
    pub fn memory_range(&self) -> (u64, u64) {
        (self.address, self.size)
    }

    /// Whether `addr` belongs to this function.
    pub fn contains(&self, addr: u64) -> bool {
        if self.size == 0 {
            addr == self.address
        } else {
            addr >= self.address && addr - self.address < self.size
        }
    }
}

/// A register recovery rule set at a specific address, as `(name, expr)`
/// pairs in record order.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CfiRules {
    /// The address the rules take effect at.
    pub address: u64,
    /// Postfix expressions to evaluate to recover register values.
    pub rules: Vec<(String, String)>,
}

/// Information used for unwinding stack frames using DWARF CFI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackInfoCfi {
    /// The initial rules for this address range.
    pub init: CfiRules,
    /// The size of this entire address range.
    pub size: u64,
    /// Additional rules to apply at specified addresses, sorted by address.
    pub add_rules: Vec<CfiRules>,
}

impl StackInfoCfi {
    pub fn memory_range(&self) -> (u64, u64) {
        (self.init.address, self.size)
    }
}

/// The STACK WIN record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowsFrameType {
    /// Frame pointer omitted; FPO data.
    Fpo,
    /// A trap frame.
    Trap,
    /// A task-switch frame.
    Tss,
    /// A standard frame with a base pointer.
    Standard,
    /// Frame pointer omitted; FrameData info with a program string.
    FrameData,
    /// Any type not listed above. Retained so callers can see the range was
    /// described, even if it cannot be used to unwind.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinStackThing {
    ProgramString(String),
    AllocatesBasePointer(bool),
}

/// Information used for unwinding stack frames using Windows frame info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowsFrameInfo {
    /// The record type.
    pub frame_type: WindowsFrameType,
    /// The address in question.
    pub address: u64,
    /// The size of the address range covered.
    pub size: u64,
    /// The size of the function's prologue.
    pub prologue_size: u32,
    /// The size of the function's epilogue.
    pub epilogue_size: u32,
    /// The size of arguments passed to this function.
    pub parameter_size: u32,
    /// The number of bytes in the stack frame for callee-saves registers.
    pub saved_register_size: u32,
    /// The number of bytes in the stack frame for local variables.
    pub local_size: u32,
    /// The maximum number of bytes pushed onto the stack by this frame.
    pub max_stack_size: u32,
    /// A program string or boolean regarding a base pointer.
    pub program_string_or_base_pointer: WinStackThing,
}

impl WindowsFrameInfo {
    pub fn memory_range(&self) -> (u64, u64) {
        (self.address, self.size)
    }
}

/// A parsed .sym file containing debug symbols.
#[derive(Debug, Default, PartialEq)]
pub struct SymbolFile {
    /// The MODULE header, if the file had one.
    pub module_info: Option<ModuleInfo>,
    /// The set of source files involved in compilation.
    pub files: HashMap<u32, String>,
    /// The logical functions referenced by inline records.
    pub inline_origins: HashMap<u32, InlineOrigin>,
    /// Publicly visible symbols, sorted by address.
    pub publics: Vec<PublicSymbol>,
    /// Functions.
    pub functions: RangeMap<Function>,
    /// DWARF CFI unwind information.
    pub cfi_stack_info: RangeMap<StackInfoCfi>,
    /// Windows unwind information, all STACK WIN types together.
    pub win_stack_info: RangeMap<WindowsFrameInfo>,
    /// Whether any record failed to parse.
    ///
    /// Rejected records are dropped; everything else remains usable.
    pub corrupt: bool,
}

impl SymbolFile {
    /// Write the canonical text form of this symbol file.
    ///
    /// Records are emitted in a fixed order (MODULE, FILE, INLINE_ORIGIN,
    /// FUNC with its INLINE and line records, PUBLIC, STACK WIN, STACK CFI)
    /// with single-space separators and lowercase hex, so parsing a
    /// canonical file and serializing it again reproduces it exactly.
    pub fn serialize<W: Write>(&self, w: &mut W) -> io::Result<()> {
        if let Some(ref info) = self.module_info {
            writeln!(
                w,
                "MODULE {} {} {} {}",
                info.os, info.cpu, info.debug_id, info.name
            )?;
        }

        let mut file_ids: Vec<_> = self.files.keys().collect();
        file_ids.sort_unstable();
        for id in file_ids {
            writeln!(w, "FILE {} {}", id, self.files[id])?;
        }

        let mut origin_ids: Vec<_> = self.inline_origins.keys().collect();
        origin_ids.sort_unstable();
        for id in origin_ids {
            let origin = &self.inline_origins[id];
            match origin.file_id {
                Some(file_id) => {
                    writeln!(w, "INLINE_ORIGIN {} {} {}", id, file_id, origin.name)?
                }
                None => writeln!(w, "INLINE_ORIGIN {} {}", id, origin.name)?,
            }
        }

        for &(_, ref func) in self.functions.entries() {
            let multiple = if func.multiple { "m " } else { "" };
            writeln!(
                w,
                "FUNC {}{:x} {:x} {:x} {}",
                multiple, func.address, func.size, func.parameter_size, func.name
            )?;
            for inline in &func.inlines {
                write!(w, "INLINE {} {}", inline.nest_level, inline.call_site_line)?;
                if let Some(file) = inline.call_site_file {
                    write!(w, " {}", file)?;
                }
                write!(w, " {}", inline.origin_id)?;
                for &(addr, size) in &inline.ranges {
                    write!(w, " {:x} {:x}", addr, size)?;
                }
                writeln!(w)?;
            }
            for &(_, ref line) in func.lines.entries() {
                writeln!(
                    w,
                    "{:x} {:x} {} {}",
                    line.address, line.size, line.line, line.file
                )?;
            }
        }

        for public in &self.publics {
            let multiple = if public.multiple { "m " } else { "" };
            writeln!(
                w,
                "PUBLIC {}{:x} {:x} {}",
                multiple, public.address, public.parameter_size, public.name
            )?;
        }

        for &(_, ref info) in self.win_stack_info.entries() {
            let ty = match info.frame_type {
                WindowsFrameType::Fpo => "0",
                WindowsFrameType::Trap => "1",
                WindowsFrameType::Tss => "2",
                WindowsFrameType::Standard => "3",
                WindowsFrameType::FrameData => "4",
                WindowsFrameType::Unknown => "ffffffff",
            };
            write!(
                w,
                "STACK WIN {} {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} ",
                ty,
                info.address,
                info.size,
                info.prologue_size,
                info.epilogue_size,
                info.parameter_size,
                info.saved_register_size,
                info.local_size,
                info.max_stack_size
            )?;
            match info.program_string_or_base_pointer {
                WinStackThing::ProgramString(ref program) => writeln!(w, "1 {}", program)?,
                WinStackThing::AllocatesBasePointer(allocates) => {
                    writeln!(w, "0 {}", allocates as u8)?
                }
            }
        }

        for &(_, ref cfi) in self.cfi_stack_info.entries() {
            write!(
                w,
                "STACK CFI INIT {:x} {:x}",
                cfi.init.address, cfi.size
            )?;
            write_cfi_rules(w, &cfi.init.rules)?;
            writeln!(w)?;
            for delta in &cfi.add_rules {
                write!(w, "STACK CFI {:x}", delta.address)?;
                write_cfi_rules(w, &delta.rules)?;
                writeln!(w)?;
            }
        }

        Ok(())
    }
}

fn write_cfi_rules<W: Write>(w: &mut W, rules: &[(String, String)]) -> io::Result<()> {
    for &(ref name, ref expr) in rules {
        write!(w, " {}: {}", name, expr)?;
    }
    Ok(())
}
