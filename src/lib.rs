//! BisonLink - run bison/flex generated parsers from a host runtime
//!
//! A grammar compiled to a shared library exports one entry point,
//! `do_parse`. This crate loads such a library, checks that it was built
//! from the expected grammar, and runs it with two capability tables: one
//! that turns every reduced grammar rule into a call of the host's
//! `_handle` method, and one that feeds the lexer from the host's `read`
//! method.
//!
//! It provides:
//! - Cross-platform dynamic loading with typed errors
//! - Grammar signature checks that detect stale modules
//! - Rule event marshaling with an optional observer hook
//! - Input relay with read hooks and explicit truncation handling
//! - A session lifecycle that always closes the module
//! - A native host runtime for driving parsers from Rust
//! - Optional Ruby bindings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bisonlink::prelude::*;
//!
//! let runtime = NativeRuntime::new();
//! let parser = NativeParser::new()
//!     .on("expr_plus", |call| Ok(Value::int(call.int_arg(0)? + call.int_arg(1)?)))
//!     .input("1 + 2\n".as_bytes())
//!     .build();
//!
//! let config = SessionConfig::new().with_expected_signature("abc123");
//! let mut session = Session::new(config);
//! let report = session
//!     .execute("build/libcalc-parser.so", &runtime, &parser)
//!     .unwrap();
//! println!("{} rule events", report.events);
//! ```
//!
//! The C side of the contract is declared in `include/bisonlink.h`.
//!
//! ## Feature Flags
//!
//! - `ruby` - Enable Ruby bindings via magnus
//! - `logging` - Enable debug logging using the `log` crate

// Lint configuration for production quality
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::module_inception)]
#![allow(clippy::missing_safety_doc)]

// Prelude module for convenient imports
pub mod prelude;

// Bridge core
pub mod engine;

// Conditional compilation for Ruby FFI
#[cfg(feature = "ruby")]
pub mod ruby_ffi;

/// Re-export commonly used types for convenience
pub use engine::{
    BridgeError, BridgeResult, GrammarSignature, HostError, HostRuntime, LoadError,
    NativeParser, NativeRuntime, ParserEngine, RelayError, Session, SessionConfig,
    SessionReport, TruncationPolicy, Value,
};
