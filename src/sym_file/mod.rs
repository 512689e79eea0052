// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::path::Path;

use crate::sym_file::parser::{parse_symbol_bytes, parse_symbol_file};
use crate::{FrameSymbolizer, FrameTrust, InlineFrame, Module, SymbolError};

pub use crate::sym_file::types::*;
pub use crate::sym_file::walker::{
    CfiFrameInfo, MemoryRegion, RegisterValue, RegisterValueMap, CFA_RULE_NAME, RA_RULE_NAME,
};

mod parser;
mod types;
pub mod walker;

impl SymbolFile {
    /// Parse a `SymbolFile` from `path`.
    ///
    /// Only I/O can fail here. Unparseable records are dropped and flag
    /// the result [`corrupt`](SymbolFile::corrupt) instead, so partially
    /// damaged symbol files remain usable.
    pub fn from_file(path: &Path) -> Result<SymbolFile, SymbolError> {
        parse_symbol_file(path)
    }

    /// Parse an in-memory `SymbolFile` from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> SymbolFile {
        parse_symbol_bytes(bytes)
    }

    /// Fill in as much source information for `frame` as possible, and
    /// append the chain of inlined calls at the frame's address to
    /// `inline_frames` (innermost call first) if it was provided.
    pub fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
        inline_frames: Option<&mut Vec<InlineFrame>>,
    ) {
        let instruction = frame.get_instruction();
        if instruction < module.base_address() {
            return;
        }
        let addr = instruction - module.base_address();

        if let Some(func) = self.functions.lookup(addr) {
            // FUNC parameter sizes aren't entirely trustworthy; a STACK WIN
            // record covering the function is the better source when there
            // is one, and those sizes feed later unwinding.
            let parameter_size = self
                .win_stack_info
                .lookup(addr)
                .map_or(func.parameter_size, |info| info.parameter_size);
            frame.set_function(
                &func.name,
                func.address + module.base_address(),
                parameter_size,
                func.multiple,
            );

            let line_record = func.lines.lookup(addr);
            if let Some(line) = line_record {
                if let Some(file) = self.files.get(&line.file) {
                    frame.set_source_file(file, line.line, line.address + module.base_address());
                }
            }

            if let Some(inline_frames) = inline_frames {
                self.construct_inline_frames(module, addr, func, frame, line_record, inline_frames);
            }
        } else if let Some(public) = self.find_nearest_public(addr) {
            // No FUNC covers the address; settle for the PUBLIC below it.
            frame.set_function(
                &public.name,
                public.address + module.base_address(),
                public.parameter_size,
                public.multiple,
            );
        }
    }

    /// Build the chain of inlined calls covering `addr`, innermost first.
    ///
    /// An inline record stores where *it* was called from, but a frame
    /// should display where its *callee* was called from. So each frame
    /// reports the call site of the next deeper inline, the innermost
    /// frame reports the line record at `addr`, and the function frame
    /// itself reports the call site of the outermost inline.
    fn construct_inline_frames(
        &self,
        module: &dyn Module,
        addr: u64,
        func: &Function,
        frame: &mut dyn FrameSymbolizer,
        line_record: Option<&SourceLine>,
        inline_frames: &mut Vec<InlineFrame>,
    ) {
        let mut chain: Vec<&Inline> = Vec::new();
        for nest_level in 0.. {
            match func
                .inlines
                .iter()
                .find(|inline| inline.nest_level == nest_level && inline.contains(addr))
            {
                Some(inline) => chain.push(inline),
                None => break,
            }
        }
        if chain.is_empty() {
            return;
        }

        let line_base = line_record.map(|line| line.address + module.base_address());
        let line_file = line_record.and_then(|line| self.files.get(&line.file)).cloned();
        let line_number = line_record.map_or(0, |line| line.line);

        // Walk inner to outer, handing each inline's call site up to the
        // frame above it.
        let mut handed_down = (line_file.clone(), line_number);
        for inline in chain.iter().rev() {
            let function = match self.inline_origins.get(&inline.origin_id) {
                Some(origin) => origin.name.clone(),
                None => "<name omitted>".to_string(),
            };
            let function_base = match inline.range_base(addr) {
                Some(base) => base,
                None => continue,
            };
            let (source_file, source_line) = handed_down;
            // Old-format inlines carry no call site file; the line
            // record's file applies.
            handed_down = (
                inline
                    .call_site_file
                    .and_then(|id| self.files.get(&id))
                    .cloned()
                    .or_else(|| line_file.clone()),
                inline.call_site_line,
            );
            inline_frames.push(InlineFrame {
                function,
                function_base: function_base + module.base_address(),
                source_file,
                source_line,
                source_line_base: line_base,
                trust: FrameTrust::Inline,
            });
        }

        let (outer_file, outer_line) = handed_down;
        if let Some(file) = outer_file {
            frame.set_source_file(&file, outer_line, line_base.unwrap_or(0));
        }
    }

    /// Find the Windows unwind record covering the frame's address.
    pub fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<&WindowsFrameInfo> {
        let addr = instruction.checked_sub(module.base_address())?;
        self.win_stack_info.lookup(addr)
    }

    /// Find the CFI unwind rules in effect at the frame's address.
    ///
    /// Starts from the covering STACK CFI INIT record and folds in every
    /// delta at or below the address, in order; a later rule for the same
    /// register replaces the earlier one.
    pub fn find_cfi_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<CfiFrameInfo> {
        let addr = instruction.checked_sub(module.base_address())?;
        let info = self.cfi_stack_info.lookup(addr)?;

        let mut frame_info = CfiFrameInfo::default();
        apply_cfi_rules(&mut frame_info, &info.init.rules);
        for delta in info.add_rules.iter().take_while(|delta| delta.address <= addr) {
            apply_cfi_rules(&mut frame_info, &delta.rules);
        }
        Some(frame_info)
    }

    /// Find the nearest `PublicSymbol` whose address is at or below `addr`.
    pub fn find_nearest_public(&self, addr: u64) -> Option<&PublicSymbol> {
        let index = self.publics.partition_point(|public| public.address <= addr);
        index.checked_sub(1).map(|index| &self.publics[index])
    }
}

fn apply_cfi_rules(frame_info: &mut CfiFrameInfo, rules: &[(String, String)]) {
    for &(ref name, ref expr) in rules {
        match name.as_str() {
            CFA_RULE_NAME => frame_info.cfa_rule = expr.clone(),
            RA_RULE_NAME => frame_info.ra_rule = expr.clone(),
            _ => {
                frame_info.register_rules.insert(name.clone(), expr.clone());
            }
        }
    }
}
