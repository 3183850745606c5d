//! Ruby FFI module
//!
//! Lets a Ruby parser object act as the host of a compiled parser module.
//! The object provides `_handle(target, option, names, values)` and
//! `read(max_size)`, plus the optional `hook_handler`, `hook_read_before`,
//! `hook_read_after` and `file` methods.

mod init;
mod runtime;

// Re-export public API
pub use init::init;
pub use runtime::{RubyName, RubyRef, RubyRuntime};
