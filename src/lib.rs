// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for resolving addresses and unwinding stack frames using
//! [Google Breakpad][breakpad]'s text-format [symbol files][symbolfiles].
//!
//! Symbol files are parsed into an immutable, address-indexed
//! [`SymbolFile`]. Point queries against it answer the questions a crash
//! processor asks about a frame: which function and source line an
//! instruction belongs to (including the chain of inlined calls covering
//! it), and which unwind rules recover the caller's registers.
//!
//! A [`SourceLineResolver`] manages the symbol files for all the modules
//! of a process, keyed by module identity.
//!
//! [breakpad]: https://chromium.googlesource.com/breakpad/breakpad/+/master/
//! [symbolfiles]: https://chromium.googlesource.com/breakpad/breakpad/+/master/docs/symbol_files.md
//!
//! # Examples
//!
//! ```
//! use breakpad_resolver::{SimpleFrame, SimpleModule, SymbolFile};
//!
//! let symbols = SymbolFile::from_bytes(
//!     b"MODULE Linux x86 ffff0000 a.out
//! FILE 0 a.c
//! FUNC 1000 30 0 main
//! 1000 30 7 0
//! ",
//! );
//! let module = SimpleModule::default();
//! let mut frame = SimpleFrame::with_instruction(0x1005);
//! symbols.fill_symbol(&module, &mut frame, None);
//! assert_eq!(frame.function.as_deref(), Some("main"));
//! assert_eq!(frame.source_file.as_deref(), Some("a.c"));
//! assert_eq!(frame.source_line, Some(7));
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use debugid::{CodeId, DebugId};
use tracing::trace;

pub use crate::sym_file::{
    CfiFrameInfo, CfiRules, Function, Inline, InlineOrigin, MemoryRegion, ModuleInfo,
    PublicSymbol, RegisterValue, RegisterValueMap, SourceLine, StackInfoCfi, SymbolFile,
    WinStackThing, WindowsFrameInfo, WindowsFrameType, CFA_RULE_NAME, RA_RULE_NAME,
};

mod range_map;
mod sym_file;

/// An executable or shared library loaded in the process being analyzed.
///
/// The identifying fields double as the key under which a
/// [`SourceLineResolver`] files the module's symbols.
pub trait Module {
    /// The base address of this code module as it was loaded by the process.
    fn base_address(&self) -> u64;
    /// The size of the code module.
    fn size(&self) -> u64;
    /// The path or file name that the code module was loaded from.
    fn code_file(&self) -> Cow<'_, str>;
    /// An identifying string used to discriminate between multiple versions
    /// and builds of the same code module.
    fn code_identifier(&self) -> Option<CodeId>;
    /// The filename containing debugging information associated with the
    /// code module, if it is stored separately (a .pdb or .dSYM).
    fn debug_file(&self) -> Option<Cow<'_, str>>;
    /// An identifier for the specific version and build of the debug file.
    fn debug_identifier(&self) -> Option<DebugId>;
    /// A human-readable representation of the code module's version.
    fn version(&self) -> Option<Cow<'_, str>>;
}

/// A `Module` implementation that just holds data.
///
/// Useful when symbolicating addresses without a real crash report to get
/// module information from.
#[derive(Clone, Debug, Default)]
pub struct SimpleModule {
    pub base_address: Option<u64>,
    pub size: Option<u64>,
    pub code_file: Option<String>,
    pub code_identifier: Option<CodeId>,
    pub debug_file: Option<String>,
    pub debug_id: Option<DebugId>,
    pub version: Option<String>,
}

impl SimpleModule {
    /// Create a `SimpleModule` with the given `debug_file` and `debug_id`.
    ///
    /// Uses `default` for the remaining fields.
    pub fn new(debug_file: &str, debug_id: DebugId) -> SimpleModule {
        SimpleModule {
            debug_file: Some(String::from(debug_file)),
            debug_id: Some(debug_id),
            ..SimpleModule::default()
        }
    }
}

impl Module for SimpleModule {
    fn base_address(&self) -> u64 {
        self.base_address.unwrap_or(0)
    }
    fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }
    fn code_file(&self) -> Cow<'_, str> {
        self.code_file
            .as_ref()
            .map_or(Cow::from(""), |s| Cow::Borrowed(&s[..]))
    }
    fn code_identifier(&self) -> Option<CodeId> {
        self.code_identifier.clone()
    }
    fn debug_file(&self) -> Option<Cow<'_, str>> {
        self.debug_file.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
    fn debug_identifier(&self) -> Option<DebugId> {
        self.debug_id
    }
    fn version(&self) -> Option<Cow<'_, str>> {
        self.version.as_ref().map(|s| Cow::Borrowed(&s[..]))
    }
}

/// How much a stack frame can be trusted, as far as this crate is
/// concerned: the frames it synthesizes come from inline records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameTrust {
    /// The frame was derived from an inline record covering the address of
    /// a real frame, not from unwinding.
    Inline,
}

/// A frame for a function that was inlined into another.
///
/// Produced by [`SymbolFile::fill_symbol`] and
/// [`SourceLineResolver::fill_source_line_info`], innermost call first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineFrame {
    /// The name of the inlined function.
    pub function: String,
    /// The start of the inline range containing the instruction.
    pub function_base: u64,
    /// The source file this frame executes in.
    pub source_file: Option<String>,
    /// The source line this frame executes at.
    pub source_line: u32,
    /// The start address of the line record at the instruction.
    pub source_line_base: Option<u64>,
    /// Always [`FrameTrust::Inline`]; carried for downstream logging.
    pub trust: FrameTrust,
}

/// A trait for setting symbol information on a stack frame.
pub trait FrameSymbolizer {
    /// Get the program counter value for this frame.
    fn get_instruction(&self) -> u64;
    /// Set the name, base address, parameter size and multiple-symbol flag
    /// of the function in which this frame is executing.
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32, multiple: bool);
    /// Set the source file and (1-based) line number, and the base address
    /// of the line's machine code.
    fn set_source_file(&mut self, file: &str, line: u32, base: u64);
}

/// A simple implementation of [`FrameSymbolizer`] that just holds data.
#[derive(Debug, Default)]
pub struct SimpleFrame {
    /// The program counter value for this frame.
    pub instruction: u64,
    /// The name of the function in which the current instruction is
    /// executing.
    pub function: Option<String>,
    /// The offset of the start of `function` from the module base.
    pub function_base: Option<u64>,
    /// The size, in bytes, that this function's parameters take up on the
    /// stack.
    pub parameter_size: Option<u32>,
    /// Whether multiple symbols collapsed into this function's symbol.
    pub is_multiple: Option<bool>,
    /// The name of the source file in which the current instruction is
    /// executing.
    pub source_file: Option<String>,
    /// The 1-based index of the line number in `source_file` in which the
    /// current instruction is executing.
    pub source_line: Option<u32>,
    /// The start address of the machine code of the current source line.
    pub source_line_base: Option<u64>,
}

impl SimpleFrame {
    /// Instantiate a [`SimpleFrame`] with instruction pointer `instruction`.
    pub fn with_instruction(instruction: u64) -> SimpleFrame {
        SimpleFrame {
            instruction,
            ..SimpleFrame::default()
        }
    }
}

impl FrameSymbolizer for SimpleFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32, multiple: bool) {
        self.function = Some(String::from(name));
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
        self.is_multiple = Some(multiple);
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file = Some(String::from(file));
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
}

/// Errors produced when loading a module's symbols.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// The symbol file could not be read.
    ///
    /// Note that an unreadable *record* is not an error: it is dropped and
    /// the module is flagged corrupt instead.
    #[error("couldn't read symbol file")]
    LoadError(#[from] std::io::Error),
}

// Can't make Module require Hash, since then it can't be used as a trait
// object (the hash method is generic), so modules are keyed by their
// identifying strings instead.
/// A key that uniquely identifies a module:
///
/// * code_file
/// * code_id
/// * debug_file
/// * debug_id
type ModuleKey = (String, Option<String>, Option<String>, Option<String>);

/// Derive a hash key from a `Module`.
fn module_key(module: &dyn Module) -> ModuleKey {
    (
        module.code_file().to_string(),
        module.code_identifier().map(|id| id.to_string()),
        module.debug_file().map(|f| f.to_string()),
        module.debug_identifier().map(|id| id.to_string()),
    )
}

/// A registry of loaded symbol files, one per module of a process.
///
/// Loads and unloads serialize against reads; lookups borrow a shared,
/// immutable [`SymbolFile`], so readers never contend with each other.
#[derive(Default)]
pub struct SourceLineResolver {
    /// Loaded symbols, keyed by module identity.
    modules: RwLock<HashMap<ModuleKey, Arc<SymbolFile>>>,
}

impl SourceLineResolver {
    /// Create an empty `SourceLineResolver`.
    pub fn new() -> SourceLineResolver {
        SourceLineResolver::default()
    }

    /// Read and parse the symbol file at `path` for `module`.
    ///
    /// On I/O failure nothing is installed. Parse failures still install
    /// the symbols that did parse, with
    /// [`is_module_corrupt`](SourceLineResolver::is_module_corrupt)
    /// reporting true. Loading a module that is already loaded replaces
    /// its symbols.
    pub fn load_module(&self, module: &dyn Module, path: &Path) -> Result<(), SymbolError> {
        let symbol_file = SymbolFile::from_file(path)?;
        trace!(
            "loaded symbol file {} for module {}",
            path.display(),
            module.code_file()
        );
        self.install(module, symbol_file);
        Ok(())
    }

    /// Parse an in-memory symbol file for `module`.
    pub fn load_module_from_bytes(&self, module: &dyn Module, bytes: &[u8]) {
        self.install(module, SymbolFile::from_bytes(bytes));
    }

    fn install(&self, module: &dyn Module, symbol_file: SymbolFile) {
        let mut modules = self.modules.write().unwrap();
        modules.insert(module_key(module), Arc::new(symbol_file));
    }

    fn get(&self, module: &dyn Module) -> Option<Arc<SymbolFile>> {
        let modules = self.modules.read().unwrap();
        modules.get(&module_key(module)).cloned()
    }

    /// Whether symbols for `module` are loaded.
    pub fn has_module(&self, module: &dyn Module) -> bool {
        self.get(module).is_some()
    }

    /// Whether the loaded symbols for `module` had unparseable records.
    ///
    /// A corrupt module still answers queries from the records that did
    /// parse. Returns false for modules that aren't loaded.
    pub fn is_module_corrupt(&self, module: &dyn Module) -> bool {
        self.get(module).map_or(false, |symbols| symbols.corrupt)
    }

    /// Discard the symbols loaded for `module`.
    pub fn unload_module(&self, module: &dyn Module) {
        let mut modules = self.modules.write().unwrap();
        modules.remove(&module_key(module));
    }

    /// Fill in as much source information for `frame` as possible, and
    /// append the chain of inlined calls at the frame's address to
    /// `inline_frames` (innermost call first) if it was provided.
    ///
    /// Does nothing if `module` has no symbols loaded or nothing covers
    /// the frame's instruction.
    pub fn fill_source_line_info(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
        inline_frames: Option<&mut Vec<InlineFrame>>,
    ) {
        if let Some(symbols) = self.get(module) {
            symbols.fill_symbol(module, frame, inline_frames);
        }
    }

    /// Find the Windows unwind record covering `instruction`.
    pub fn find_windows_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<WindowsFrameInfo> {
        self.get(module)?
            .find_windows_frame_info(module, instruction)
            .cloned()
    }

    /// Find the CFI unwind rules in effect at `instruction`.
    pub fn find_cfi_frame_info(
        &self,
        module: &dyn Module,
        instruction: u64,
    ) -> Option<CfiFrameInfo> {
        self.get(module)?.find_cfi_frame_info(module, instruction)
    }
}
