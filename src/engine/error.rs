//! Error taxonomy for the bridge
//!
//! Failures are grouped by where they originate so callers can react to
//! each class differently:
//!
//! - [`LoadError`] - the compiled module could not be opened, inspected or
//!   closed (usually: recompile or give up)
//! - [`HostError`] - the host runtime refused an attribute lookup or a call
//! - [`RelayError`] - an input fill failed
//! - [`BridgeError`] - the session-level error wrapping all of the above,
//!   plus the stale-module and pending-exception conditions

use std::fmt;

/// Result type used throughout the bridge
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Result type for host-runtime operations
pub type HostResult<T> = Result<T, HostError>;

/// Failure of a dynamic library operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The module file does not exist
    NotFound {
        /// Path that was looked up
        path: String,
    },

    /// The path cannot be handed to the platform loader
    InvalidPath {
        /// Offending path
        path: String,
    },

    /// The platform loader refused the image (wrong architecture, broken
    /// ELF/PE, unresolved dependencies, ...)
    InvalidImage {
        /// Path of the module
        path: String,
        /// Message reported by the platform loader
        reason: String,
    },

    /// A required symbol is not exported by the module
    MissingSymbol {
        /// Name of the symbol
        symbol: String,
    },

    /// The platform loader failed to unload the module
    CloseFailed {
        /// Message reported by the platform loader
        reason: String,
    },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound { path } => write!(f, "Module not found: {}", path),
            LoadError::InvalidPath { path } => write!(f, "Invalid module path: {:?}", path),
            LoadError::InvalidImage { path, reason } => {
                write!(f, "Cannot load module {}: {}", path, reason)
            }
            LoadError::MissingSymbol { symbol } => {
                write!(f, "Module does not export required symbol `{}`", symbol)
            }
            LoadError::CloseFailed { reason } => write!(f, "Cannot close module: {}", reason),
        }
    }
}

impl std::error::Error for LoadError {}

/// Failure reported by the host runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The host object has no attribute of that name
    MissingAttribute {
        /// Attribute name
        name: String,
    },

    /// The user interrupted the host (e.g. Ctrl-C during a read)
    Interrupted,

    /// The host raised an exception
    Raised {
        /// Exception message as rendered by the host
        message: String,
    },

    /// A value had an unexpected type
    TypeMismatch {
        /// Expected type
        expected: String,
        /// Actual type found
        actual: String,
    },
}

impl HostError {
    /// Shorthand for a raised host exception
    pub fn raised(message: impl Into<String>) -> Self {
        HostError::Raised {
            message: message.into(),
        }
    }

    /// Shorthand for a missing attribute
    pub fn missing(name: impl Into<String>) -> Self {
        HostError::MissingAttribute { name: name.into() }
    }

    /// True for the user-interrupt signal
    pub fn is_interrupt(&self) -> bool {
        matches!(self, HostError::Interrupted)
    }

    /// True when the failure only means "this attribute does not exist"
    pub fn is_missing_attribute(&self) -> bool {
        matches!(self, HostError::MissingAttribute { .. })
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::MissingAttribute { name } => {
                write!(f, "Host object has no attribute `{}`", name)
            }
            HostError::Interrupted => write!(f, "Interrupted"),
            HostError::Raised { message } => write!(f, "Host exception: {}", message),
            HostError::TypeMismatch { expected, actual } => {
                write!(f, "Type mismatch: expected {}, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for HostError {}

/// Failure of an input fill
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A read hook or the read call failed
    Host(HostError),

    /// The host produced more text than the lexer buffer holds
    Truncated {
        /// Number of bytes the host produced
        produced: usize,
        /// Capacity of the lexer buffer
        capacity: usize,
    },
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Host(e) => write!(f, "Input read failed: {}", e),
            RelayError::Truncated { produced, capacity } => write!(
                f,
                "Input truncated: read produced {} bytes but the buffer holds {}",
                produced, capacity
            ),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Host(e) => Some(e),
            RelayError::Truncated { .. } => None,
        }
    }
}

impl From<HostError> for RelayError {
    fn from(e: HostError) -> Self {
        RelayError::Host(e)
    }
}

/// Session-level failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Opening, resolving or closing the module failed
    Load(LoadError),

    /// The module was built from a different grammar than expected
    StaleModule {
        /// Signature the caller expected
        expected: String,
        /// Signature exported by the module
        found: String,
    },

    /// A signature check was requested but the module exports none
    MissingSignature,

    /// A host call failed outside of a parse run
    Host(HostError),

    /// An input fill failed
    Relay(RelayError),

    /// The parser returned normally but left a host failure pending
    PendingException(HostError),

    /// An operation was attempted in the wrong session state
    InvalidState {
        /// State the operation requires
        expected: &'static str,
        /// State the session was in
        actual: &'static str,
    },

    /// The session configuration is unusable
    InvalidConfig {
        /// Why the configuration was rejected
        reason: String,
    },
}

impl BridgeError {
    /// True for loader failures (missing file, bad image, missing symbol)
    pub fn is_load_failure(&self) -> bool {
        matches!(self, BridgeError::Load(_))
    }

    /// True when the module should be recompiled from its grammar
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            BridgeError::StaleModule { .. } | BridgeError::MissingSignature
        )
    }

    /// True for input relay failures
    pub fn is_relay_failure(&self) -> bool {
        matches!(self, BridgeError::Relay(_))
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Load(e) => write!(f, "{}", e),
            BridgeError::StaleModule { expected, found } => write!(
                f,
                "Stale compiled module: expected grammar signature {}, module has {}",
                expected, found
            ),
            BridgeError::MissingSignature => {
                write!(f, "Stale compiled module: no grammar signature exported")
            }
            BridgeError::Host(e) => write!(f, "{}", e),
            BridgeError::Relay(e) => write!(f, "{}", e),
            BridgeError::PendingException(e) => write!(f, "Parse failed: {}", e),
            BridgeError::InvalidState { expected, actual } => write!(
                f,
                "Invalid session state: expected {}, session is {}",
                expected, actual
            ),
            BridgeError::InvalidConfig { reason } => {
                write!(f, "Invalid session configuration: {}", reason)
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Load(e) => Some(e),
            BridgeError::Host(e) | BridgeError::PendingException(e) => Some(e),
            BridgeError::Relay(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LoadError> for BridgeError {
    fn from(e: LoadError) -> Self {
        BridgeError::Load(e)
    }
}

impl From<HostError> for BridgeError {
    fn from(e: HostError) -> Self {
        BridgeError::Host(e)
    }
}

impl From<RelayError> for BridgeError {
    fn from(e: RelayError) -> Self {
        BridgeError::Relay(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes_are_distinct() {
        let load: BridgeError = LoadError::MissingSymbol {
            symbol: "do_parse".to_string(),
        }
        .into();
        assert!(load.is_load_failure());
        assert!(!load.is_relay_failure());

        let relay: BridgeError = RelayError::Truncated {
            produced: 10,
            capacity: 4,
        }
        .into();
        assert!(relay.is_relay_failure());
        assert!(!relay.is_load_failure());

        let stale = BridgeError::StaleModule {
            expected: "xyz999".to_string(),
            found: "abc123".to_string(),
        };
        assert!(stale.is_stale());
        assert!(!stale.is_load_failure());
    }

    #[test]
    fn test_display_messages() {
        let e = LoadError::NotFound {
            path: "/tmp/nope.so".to_string(),
        };
        assert_eq!(e.to_string(), "Module not found: /tmp/nope.so");

        let e = HostError::missing("_handle");
        assert!(e.to_string().contains("_handle"));
        assert!(e.is_missing_attribute());

        let e = BridgeError::StaleModule {
            expected: "a".to_string(),
            found: "b".to_string(),
        };
        assert!(e.to_string().starts_with("Stale compiled module"));
    }

    #[test]
    fn test_relay_error_source() {
        use std::error::Error;

        let e = RelayError::from(HostError::Interrupted);
        assert!(e.source().is_some());
        let e = RelayError::Truncated {
            produced: 1,
            capacity: 0,
        };
        assert!(e.source().is_none());
    }
}
