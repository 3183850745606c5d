//! Bridge core
//!
//! Loads a compiled bison/flex parser module, verifies its grammar
//! signature, and relays its rule events and input requests to a host
//! runtime.
//!
//! # Modules
//!
//! - [`loader`] - platform dynamic library loading
//! - [`symbols`] - the native ABI and symbol resolution
//! - [`host`] - the host runtime contract
//! - [`marshal`] - rule event dispatch
//! - [`relay`] - input relay
//! - [`trampoline`] - `extern "C"` entry points the parser calls back into
//! - [`session`] - load/run/close lifecycle
//! - [`signature`] - grammar signatures
//! - [`native`] - an in-process host runtime

pub mod error;
pub mod host;
pub mod loader;
pub mod marshal;
pub mod native;
pub mod relay;
pub mod session;
pub mod signature;
pub mod symbols;
pub mod trampoline;

// Errors
pub use error::{BridgeError, BridgeResult, HostError, HostResult, LoadError, RelayError};

// Loading
pub use loader::{default_engine_name, engine_library_path, library_filename, Library};
pub use symbols::{
    CompiledModule, DynamicLoader, EntryPoint, MarshalerAbi, ModuleLoader, ParserModule,
    RawHostRef, RelayAbi, ResetHook, TokenFn, ENTRY_SYMBOL, RESET_SYMBOL, SIGNATURE_SYMBOL,
};

// Host contract
pub use host::{Attr, AttributeCache, HostRuntime};

// Callbacks
pub use marshal::{invoke, RuleEvent};
pub use relay::{fill, FillOutcome, TruncationPolicy};
pub use trampoline::{BridgeContext, BridgeStats};

// Sessions
pub use session::{
    check_signature, ParserEngine, Session, SessionConfig, SessionReport, SessionState,
    DEFAULT_MAX_RUNS,
};
pub use signature::GrammarSignature;

// Native runtime
pub use native::{
    InputSource, NativeFn, NativeParser, NativeRuntime, Object, ParseNode, RuleCall, Value,
    ValueRef, LAST_RESULT,
};
