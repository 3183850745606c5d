//! Prelude module for convenient imports
//!
//! This module re-exports the most commonly used types and traits from
//! bisonlink. Importing this module with a wildcard import brings the core
//! types into scope:
//!
//! ```
//! use bisonlink::prelude::*;
//! ```
//!
//! # Re-exported Items
//!
//! ## Sessions
//! - [`Session`] - Load, run and close one compiled module
//! - [`ParserEngine`] - Keep a module loaded across runs
//! - [`SessionConfig`] - Signature, debug and truncation settings
//! - [`SessionReport`] - What a session did
//!
//! ## Host Runtime
//! - [`HostRuntime`] - The contract a host runtime implements
//! - [`NativeRuntime`] - In-process runtime over native values
//! - [`NativeParser`] - Builder for native parser objects
//! - [`Value`] - Native host value
//!
//! ## Error Handling
//! - [`BridgeError`] - Session-level error
//! - [`HostError`] - Host runtime error
//! - [`LoadError`] - Dynamic loading error

// ============================================================================
// Sessions
// ============================================================================

pub use crate::engine::session::{ParserEngine, Session, SessionConfig, SessionReport};
pub use crate::engine::signature::GrammarSignature;
pub use crate::engine::relay::TruncationPolicy;

// ============================================================================
// Host Runtime
// ============================================================================

pub use crate::engine::host::HostRuntime;
pub use crate::engine::native::{NativeParser, NativeRuntime, ParseNode, RuleCall, Value, ValueRef};

// ============================================================================
// Error Handling
// ============================================================================

pub use crate::engine::error::{BridgeError, BridgeResult, HostError, LoadError, RelayError};
