//! Input relay
//!
//! The generated lexer asks for more text whenever its buffer runs dry.
//! [`fill`] answers that request from the host object:
//!
//! 1. `hook_read_before()` if defined (result ignored)
//! 2. `read(max_size)`; a user interrupt here counts as end of input
//! 3. `hook_read_after(text)` if defined; its result replaces the text
//! 4. copy at most `max_size` bytes into the lexer buffer
//! 5. on end of input, `file.close()` if the host has a file object
//!
//! A fill that writes zero bytes tells the lexer the input is exhausted.

use serde::{Deserialize, Serialize};

use super::error::{HostError, RelayError};
use super::host::{Attr, HostRuntime};

/// Logging macros - no-op when logging feature is disabled
#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

/// Logging macros - use log crate when logging feature is enabled
#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}

/// What to do when the host returns more text than the buffer holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationPolicy {
    /// Copy what fits and report the dropped byte count
    #[default]
    Clamp,
    /// Fail the fill
    Strict,
}

/// Result of one fill
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FillOutcome {
    /// Bytes written into the buffer (0 = end of input)
    pub written: usize,
    /// Bytes the host produced that did not fit
    pub truncated: usize,
    /// True when the read was interrupted by the user
    pub interrupted: bool,
    /// Failure while closing the host file at end of input
    pub cleanup_error: Option<HostError>,
}

impl FillOutcome {
    /// True when this fill signals end of input
    pub fn is_eof(&self) -> bool {
        self.written == 0
    }
}

/// Fill `buf` with the next chunk of host input
pub fn fill<R: HostRuntime>(
    runtime: &R,
    parser: &R::Object,
    buf: &mut [u8],
    policy: TruncationPolicy,
) -> Result<FillOutcome, RelayError> {
    let max_size = buf.len();

    if let Some(before) = runtime.attr_optional(parser, Attr::HookReadBefore)? {
        runtime.call(&before, &[])?;
    }

    let read = runtime.attr(parser, Attr::Read)?;
    let size = runtime.new_int(i64::try_from(max_size).unwrap_or(i64::MAX))?;
    let text = match runtime.call(&read, &[size]) {
        Ok(text) => Some(text),
        Err(HostError::Interrupted) => None,
        Err(e) => return Err(e.into()),
    };

    let mut outcome = FillOutcome::default();

    match text {
        Some(mut text) => {
            if let Some(after) = runtime.attr_optional(parser, Attr::HookReadAfter)? {
                text = runtime.call(&after, &[text])?;
            }

            let bytes = runtime.text_bytes(&text)?;
            if bytes.len() > max_size {
                if policy == TruncationPolicy::Strict {
                    return Err(RelayError::Truncated {
                        produced: bytes.len(),
                        capacity: max_size,
                    });
                }
                outcome.truncated = bytes.len() - max_size;
                log_warn!(
                    "read produced {} bytes for a {} byte buffer; dropping {}",
                    bytes.len(),
                    max_size,
                    outcome.truncated
                );
            }

            let written = bytes.len().min(max_size);
            buf[..written].copy_from_slice(&bytes[..written]);
            outcome.written = written;
        }
        None => outcome.interrupted = true,
    }

    if outcome.written == 0 {
        if let Err(e) = close_input(runtime, parser) {
            log_warn!("closing input at end of stream failed: {}", e);
            outcome.cleanup_error = Some(e);
        }
    }

    Ok(outcome)
}

/// Mark the host file object closed; only the host-side object is closed,
/// never the underlying descriptor
fn close_input<R: HostRuntime>(runtime: &R, parser: &R::Object) -> Result<(), HostError> {
    let Some(file) = runtime.attr_optional(parser, Attr::File)? else {
        return Ok(());
    };
    let Some(close) = runtime.attr_optional(&file, Attr::Close)? else {
        return Ok(());
    };
    runtime.call(&close, &[]).map(|_| ())
}
