//! Symbol contract between the bridge and a compiled parser module
//!
//! Every module exports:
//!
//! | Symbol | Kind | Required |
//! |--------|------|----------|
//! | `do_parse` | [`EntryPoint`] | yes |
//! | `rules_hash` | `const char *` variable | yes (may be checked) |
//! | `reset_flex_buffer` | [`ResetHook`] | no |
//!
//! The entry point does not receive bare callback addresses. It receives
//! two capability tables, [`MarshalerAbi`] and [`RelayAbi`], each carrying
//! an opaque context pointer that must be passed back on every call. The C
//! declarations live in `include/bisonlink.h`.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::Path;

use super::error::LoadError;
use super::loader::Library;

/// Name of the parse entry point
pub const ENTRY_SYMBOL: &str = "do_parse";

/// Name of the grammar signature variable
pub const SIGNATURE_SYMBOL: &str = "rules_hash";

/// Name of the optional lexer buffer reset hook
pub const RESET_SYMBOL: &str = "reset_flex_buffer";

/// Opaque reference to a host-runtime value as seen by native code
pub type RawHostRef = *mut c_void;

/// Rule-event callback: `(ctx, parser, target, option, nargs, names, values)`
///
/// Returns a new host reference owned by the caller, or null when the
/// event failed (the failure is left pending on the bridge side).
pub type InvokeFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    parser: RawHostRef,
    target: *const c_char,
    option: c_int,
    nargs: c_int,
    names: *const *const c_char,
    values: *const RawHostRef,
) -> RawHostRef;

/// Drops a host reference previously returned by [`InvokeFn`] or [`TokenFn`]
pub type ReleaseFn = unsafe extern "C" fn(ctx: *mut c_void, value: RawHostRef);

/// Token callback: `(ctx, text, len)`, builds a host string from lexer text
///
/// Returns a new host reference owned by the caller, or null on failure.
pub type TokenFn =
    unsafe extern "C" fn(ctx: *mut c_void, text: *const c_char, len: c_int) -> RawHostRef;

/// Input callback: `(ctx, parser, buf, max_size)`, returns bytes written
pub type FillFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    parser: RawHostRef,
    buf: *mut c_char,
    max_size: c_int,
) -> c_int;

/// Capability table for raising rule events
#[repr(C)]
pub struct MarshalerAbi {
    /// Context to pass back on every call
    pub ctx: *mut c_void,
    /// Marshal and invoke a rule event
    pub invoke: InvokeFn,
    /// Release a value returned by `invoke` or `token`
    pub release: ReleaseFn,
    /// Build a token value from matched text
    pub token: TokenFn,
}

/// Capability table for requesting input
#[repr(C)]
pub struct RelayAbi {
    /// Context to pass back on every call
    pub ctx: *mut c_void,
    /// Fill the lexer buffer
    pub fill: FillFn,
}

/// Parse entry point: `(parser, marshaler, relay, debug)`
pub type EntryPoint =
    unsafe extern "C" fn(RawHostRef, *const MarshalerAbi, *const RelayAbi, c_int);

/// Lexer buffer reset hook
pub type ResetHook = unsafe extern "C" fn();

// ============================================================================
// Compiled modules
// ============================================================================

/// A parser module whose symbols have been resolved
pub trait CompiledModule {
    /// Grammar signature exported by the module
    fn signature(&self) -> Option<&str>;

    /// Parse entry point
    fn entry_point(&self) -> EntryPoint;

    /// Lexer buffer reset hook, when exported
    fn reset_hook(&self) -> Option<ResetHook> {
        None
    }

    /// Discard any input the lexer buffered during a previous run
    fn reset_buffer(&self) {
        if let Some(hook) = self.reset_hook() {
            unsafe { hook() };
        }
    }
}

/// Opens and closes compiled modules
pub trait ModuleLoader {
    /// Module type produced by this loader
    type Module: CompiledModule;

    /// Open the module at `path` and resolve its symbols
    fn open(&self, path: &Path) -> Result<Self::Module, LoadError>;

    /// Close a module; it must not be used afterwards
    fn close(&self, module: Self::Module) -> Result<(), LoadError>;
}

/// A shared library holding a generated parser and lexer
///
/// The signature and function pointers are resolved once in
/// [`ParserModule::load`] and stay valid until the module is closed.
#[derive(Debug)]
pub struct ParserModule {
    library: Library,
    signature: Option<String>,
    entry: EntryPoint,
    reset: Option<ResetHook>,
}

impl ParserModule {
    /// Open a module and resolve the symbol contract
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let library = Library::open(path)?;

        let entry_address = library.resolve(ENTRY_SYMBOL)?;
        let entry: EntryPoint = unsafe { std::mem::transmute(entry_address) };

        let signature_address = library.resolve(SIGNATURE_SYMBOL)?;
        let signature = unsafe { read_signature(signature_address) };

        let reset = library
            .resolve_optional(RESET_SYMBOL)
            .map(|address| unsafe { std::mem::transmute::<*mut c_void, ResetHook>(address) });

        Ok(Self {
            library,
            signature,
            entry,
            reset,
        })
    }

    /// Path the module was loaded from
    pub fn path(&self) -> &Path {
        self.library.path()
    }

    /// Unload the module
    pub fn close(self) -> Result<(), LoadError> {
        self.library.close()
    }
}

impl CompiledModule for ParserModule {
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    fn entry_point(&self) -> EntryPoint {
        self.entry
    }

    fn reset_hook(&self) -> Option<ResetHook> {
        self.reset
    }
}

/// `rules_hash` is a `char *` variable: the symbol address points at the
/// pointer, not at the characters.
unsafe fn read_signature(address: *mut c_void) -> Option<String> {
    let slot = address as *const *const c_char;
    let text = *slot;
    if text.is_null() {
        return None;
    }
    Some(CStr::from_ptr(text).to_string_lossy().into_owned())
}

/// Loader for modules on disk
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLoader;

impl ModuleLoader for DynamicLoader {
    type Module = ParserModule;

    fn open(&self, path: &Path) -> Result<ParserModule, LoadError> {
        ParserModule::load(path)
    }

    fn close(&self, module: ParserModule) -> Result<(), LoadError> {
        module.close()
    }
}
