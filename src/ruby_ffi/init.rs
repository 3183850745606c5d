//! Ruby module initialization

use magnus::{function, prelude::*, Error, ExceptionClass, RHash, RModule, Ruby, Value};

use super::runtime::{RubyRef, RubyRuntime};
use crate::engine::error::BridgeError;
use crate::engine::session::{Session, SessionConfig};

/// Initialize the Ruby native extension module
///
/// ```ruby
/// BisonLink::Native.run("build/libcalc-parser.so", parser, "abc123", false)
/// # => {"runs"=>1, "events"=>3, "fills"=>2, "bytes_read"=>6, "truncated_bytes"=>0}
/// ```
#[magnus::init]
pub fn init(ruby: &Ruby) -> Result<(), Error> {
    let module = ruby.define_module("BisonLink")?;
    let base = module.define_error("Error", ruby.exception_standard_error())?;
    module.define_error("StaleModuleError", base)?;
    module.define_error("LoadError", base)?;

    let native_module = module.define_module("Native")?;
    native_module.define_module_function("run", function!(run, 4))?;

    Ok(())
}

/// Load the module at `path`, run it against `parser`, close it
fn run(
    ruby: &Ruby,
    path: String,
    parser: Value,
    expected: Option<String>,
    debug: bool,
) -> Result<RHash, Error> {
    let mut config = SessionConfig::new().with_debug(debug);
    if let Some(expected) = expected {
        config = config.with_expected_signature(expected);
    }

    let runtime = RubyRuntime::new(ruby);
    let mut session = Session::new(config);

    match session.execute(&path, &runtime, &RubyRef::Value(parser)) {
        Ok(report) => {
            let hash = ruby.hash_new();
            hash.aset("runs", report.runs)?;
            hash.aset("events", report.events)?;
            hash.aset("fills", report.fills)?;
            hash.aset("bytes_read", report.bytes_read)?;
            hash.aset("truncated_bytes", report.truncated_bytes)?;
            Ok(hash)
        }
        Err(e) => Err(to_ruby_error(ruby, &runtime, e)),
    }
}

/// Re-raise the original Ruby exception where there is one
fn to_ruby_error(ruby: &Ruby, runtime: &RubyRuntime<'_>, error: BridgeError) -> Error {
    if let BridgeError::PendingException(_) | BridgeError::Relay(_) | BridgeError::Host(_) = error {
        if let Some(original) = runtime.take_ruby_error() {
            return original;
        }
    }

    let class = if error.is_stale() {
        error_class(ruby, "StaleModuleError")
    } else if error.is_load_failure() {
        error_class(ruby, "LoadError")
    } else {
        error_class(ruby, "Error")
    };

    match class {
        Ok(class) => Error::new(class, error.to_string()),
        Err(lookup) => lookup,
    }
}

fn error_class(ruby: &Ruby, name: &str) -> Result<ExceptionClass, Error> {
    let module: RModule = ruby.class_object().const_get("BisonLink")?;
    module.const_get(name)
}
