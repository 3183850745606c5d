//! RubyRuntime - HostRuntime over magnus values
//!
//! In Ruby every attribute is a method, so attribute lookups are lazy:
//! `get_attr` returns a [`RubyRef::Bound`] (receiver plus method name) and
//! only [`call`](HostRuntime::call) or a nested lookup actually invokes it.
//! Reading `parser.file.closed` therefore calls `file` and then `closed?`,
//! while calling `parser._handle(...)` is a single method call.
//!
//! Ruby's collector only scans the machine stack and registered addresses.
//! Values built here are pushed into a Ruby array or boxed as soon as they
//! exist, never parked in a Rust heap buffer across another allocation.

use std::cell::RefCell;

use magnus::value::{BoxValue, Id, ReprValue};
use magnus::{Error, RString, Ruby, TryConvert, Value};

use crate::engine::error::{HostError, HostResult};
use crate::engine::host::{AttributeCache, HostRuntime};
use crate::engine::symbols::RawHostRef;

static NAMES: AttributeCache<RubyName> = AttributeCache::new();

/// Interned method name
#[derive(Debug, Clone, Copy)]
pub struct RubyName {
    id: Id,
    name: &'static str,
}

/// A Ruby value, or a method not yet invoked on its receiver
#[derive(Debug, Clone, Copy)]
pub enum RubyRef {
    /// A plain value
    Value(Value),
    /// `recv.name`, invoked on use
    Bound {
        /// Receiver
        recv: Value,
        /// Method name
        name: RubyName,
    },
}

impl From<Value> for RubyRef {
    fn from(value: Value) -> Self {
        RubyRef::Value(value)
    }
}

/// Value held by native code; registered with the GC while it lives
struct Exported {
    recv: BoxValue<Value>,
    name: Option<RubyName>,
}

/// Host runtime for a Ruby parser object
pub struct RubyRuntime<'r> {
    ruby: &'r Ruby,
    last_error: RefCell<Option<Error>>,
}

impl<'r> RubyRuntime<'r> {
    /// Create a runtime on the current Ruby thread
    pub fn new(ruby: &'r Ruby) -> Self {
        Self {
            ruby,
            last_error: RefCell::new(None),
        }
    }

    /// The most recent Ruby exception seen, so it can be re-raised as is
    pub fn take_ruby_error(&self) -> Option<Error> {
        self.last_error.borrow_mut().take()
    }

    fn convert_error(&self, error: Error) -> HostError {
        let converted = if error.is_kind_of(self.ruby.exception_interrupt()) {
            HostError::Interrupted
        } else {
            HostError::raised(error.to_string())
        };

        let mut last = self.last_error.borrow_mut();
        if last.is_none() {
            *last = Some(error);
        }
        converted
    }

    /// Invoke a bound method; plain values are returned as they are
    fn resolve(&self, value: &RubyRef) -> HostResult<Value> {
        match value {
            RubyRef::Value(v) => Ok(*v),
            RubyRef::Bound { recv, name } => recv
                .funcall::<Id, (), Value>(name.id, ())
                .map_err(|e| self.convert_error(e)),
        }
    }
}

impl HostRuntime for RubyRuntime<'_> {
    type Object = RubyRef;
    type Name = RubyName;

    fn names(&self) -> &AttributeCache<RubyName> {
        &NAMES
    }

    fn intern(&self, name: &'static str) -> HostResult<RubyName> {
        // Ruby spells predicates with a question mark (`IO#closed?`).
        let method = match name {
            "closed" => "closed?",
            other => other,
        };
        Ok(RubyName {
            id: self.ruby.intern(method),
            name,
        })
    }

    fn get_attr(&self, object: &RubyRef, name: &RubyName) -> HostResult<RubyRef> {
        let recv = self.resolve(object)?;
        let responds = recv
            .respond_to(name.id, false)
            .map_err(|e| self.convert_error(e))?;
        if !responds {
            return Err(HostError::missing(name.name));
        }
        Ok(RubyRef::Bound { recv, name: *name })
    }

    fn has_attr(&self, object: &RubyRef, name: &RubyName) -> bool {
        self.resolve(object)
            .and_then(|recv| {
                recv.respond_to(name.id, false)
                    .map_err(|e| self.convert_error(e))
            })
            .unwrap_or(false)
    }

    fn call(&self, callable: &RubyRef, args: &[RubyRef]) -> HostResult<RubyRef> {
        // Resolving a bound argument runs Ruby code; earlier ones stay boxed.
        let rooted = args
            .iter()
            .map(|arg| self.resolve(arg).map(BoxValue::new))
            .collect::<HostResult<Vec<BoxValue<Value>>>>()?;
        let args: Vec<Value> = rooted.iter().map(|value| **value).collect();

        let result = match callable {
            RubyRef::Bound { recv, name } => recv.funcall::<Id, &[Value], Value>(name.id, &args),
            RubyRef::Value(proc) => proc.funcall::<&str, &[Value], Value>("call", &args),
        };
        drop(rooted);
        result.map(RubyRef::Value).map_err(|e| self.convert_error(e))
    }

    fn new_str(&self, value: &str) -> HostResult<RubyRef> {
        Ok(RubyRef::Value(self.ruby.str_new(value).as_value()))
    }

    fn new_bytes(&self, value: &[u8]) -> HostResult<RubyRef> {
        Ok(RubyRef::Value(self.ruby.str_from_slice(value).as_value()))
    }

    fn new_int(&self, value: i64) -> HostResult<RubyRef> {
        Ok(RubyRef::Value(self.ruby.integer_from_i64(value).as_value()))
    }

    fn new_list(&self, items: Vec<RubyRef>) -> HostResult<RubyRef> {
        let ary = self.ruby.ary_new_capa(items.len());
        for item in &items {
            let value = self.resolve(item)?;
            ary.push(value).map_err(|e| self.convert_error(e))?;
        }
        Ok(RubyRef::Value(ary.as_value()))
    }

    fn new_str_list(&self, items: &[String]) -> HostResult<RubyRef> {
        let ary = self.ruby.ary_new_capa(items.len());
        for item in items {
            ary.push(self.ruby.str_new(item))
                .map_err(|e| self.convert_error(e))?;
        }
        Ok(RubyRef::Value(ary.as_value()))
    }

    fn text_bytes(&self, value: &RubyRef) -> HostResult<Vec<u8>> {
        let value = self.resolve(value)?;
        let text = RString::try_convert(value).map_err(|_| HostError::TypeMismatch {
            expected: "String".to_string(),
            actual: value.class().to_string(),
        })?;
        // Copied before any further Ruby call can move the string.
        Ok(unsafe { text.as_slice() }.to_vec())
    }

    fn is_truthy(&self, value: &RubyRef) -> HostResult<bool> {
        Ok(self.resolve(value)?.to_bool())
    }

    fn export(&self, value: RubyRef) -> RawHostRef {
        let exported = match value {
            RubyRef::Value(v) => Exported {
                recv: BoxValue::new(v),
                name: None,
            },
            RubyRef::Bound { recv, name } => Exported {
                recv: BoxValue::new(recv),
                name: Some(name),
            },
        };
        Box::into_raw(Box::new(exported)) as RawHostRef
    }

    unsafe fn borrow_raw(&self, raw: RawHostRef) -> RubyRef {
        let exported = &*(raw as *const Exported);
        let recv = *exported.recv;
        match exported.name {
            None => RubyRef::Value(recv),
            Some(name) => RubyRef::Bound { recv, name },
        }
    }

    unsafe fn release_raw(&self, raw: RawHostRef) {
        drop(Box::from_raw(raw as *mut Exported));
    }
}
