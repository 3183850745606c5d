//! Rule event marshaling
//!
//! When a grammar rule fires, the generated parser raises a rule event: the
//! target name, the option code of the alternative that matched, and the
//! named values of the right-hand side. [`invoke`] turns that event into a
//! call of the host's `_handle` method and, if the host defines one, a call
//! of its `hook_handler` observer.
//!
//! ```text
//! _handle(target, option, names, values)                -> primary
//! hook_handler(target, option, names, values, primary)  -> result
//! ```

use super::error::{HostError, HostResult};
use super::host::{Attr, HostRuntime};

/// One rule invocation raised by the parser
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEvent<V> {
    /// Name of the rule (grammar target)
    pub target: String,
    /// Option code of the alternative that matched
    pub option: i32,
    /// Right-hand-side values, in grammar order
    pub args: Vec<(String, V)>,
}

impl<V> RuleEvent<V> {
    /// Create an event; argument names must be unique within the event
    pub fn new(
        target: impl Into<String>,
        option: i32,
        args: Vec<(String, V)>,
    ) -> HostResult<Self> {
        for (i, (name, _)) in args.iter().enumerate() {
            if args[..i].iter().any(|(other, _)| other == name) {
                return Err(HostError::raised(format!(
                    "duplicate argument name `{}` in rule event",
                    name
                )));
            }
        }

        Ok(Self {
            target: target.into(),
            option,
            args,
        })
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// True when the rule has no arguments
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Split into parallel name and value sequences, keeping pairing order
    pub fn split(self) -> (Vec<String>, Vec<V>) {
        self.args.into_iter().unzip()
    }
}

/// Invoke the host handler (and observer) for one rule event
///
/// A missing `_handle` is a configuration error and is returned as is.
/// A missing `hook_handler` just means no observer is installed; any other
/// failure to fetch the observer is propagated.
pub fn invoke<R: HostRuntime>(
    runtime: &R,
    parser: &R::Object,
    event: RuleEvent<R::Object>,
) -> HostResult<R::Object> {
    let target = event.target.clone();
    let option = event.option;
    let (names, values) = event.split();

    // Both calls read the same lists; they stay alive until both return.
    let args = [
        runtime.new_str(&target)?,
        runtime.new_int(i64::from(option))?,
        runtime.new_str_list(&names)?,
        runtime.new_list(values)?,
    ];

    let handler = runtime.attr(parser, Attr::Handle)?;
    let primary = runtime.call(&handler, &args)?;

    let observer = match runtime.attr(parser, Attr::HookHandler) {
        Ok(observer) => observer,
        Err(e) if e.is_missing_attribute() => return Ok(primary),
        Err(e) => return Err(e),
    };

    let [target, option, names, values] = args;
    runtime.call(&observer, &[target, option, names, values, primary])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::native::{NativeParser, NativeRuntime, Value};

    fn pairs(items: &[(&str, i64)]) -> Vec<(String, std::rc::Rc<Value>)> {
        items
            .iter()
            .map(|(n, v)| (n.to_string(), Value::int(*v)))
            .collect()
    }

    #[test]
    fn test_rule_event_rejects_duplicate_names() {
        let err = RuleEvent::new("expr", 0, pairs(&[("left", 1), ("left", 2)])).unwrap_err();
        assert!(matches!(err, HostError::Raised { .. }));
    }

    #[test]
    fn test_split_keeps_order() {
        let event = RuleEvent::new("expr", 0, vec![("b".to_string(), 2), ("a".to_string(), 1)])
            .unwrap();
        let (names, values) = event.split();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(values, vec![2, 1]);
    }

    #[test]
    fn test_primary_result_without_observer() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new()
            .on("expr_plus", |call| {
                Ok(Value::int(call.int_arg(0)? + call.int_arg(1)?))
            })
            .build();

        let event = RuleEvent::new("expr_plus", 1, pairs(&[("left", 3), ("right", 4)])).unwrap();
        let result = invoke(&runtime, &parser, event).unwrap();
        assert_eq!(result.as_int(), Some(7));
    }

    #[test]
    fn test_observer_replaces_result() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new()
            .on("expr_plus", |call| {
                Ok(Value::int(call.int_arg(0)? + call.int_arg(1)?))
            })
            .observer(|args| {
                assert_eq!(args.len(), 5);
                let primary = args[4].as_int().unwrap_or_default();
                Ok(Value::int(primary * 10))
            })
            .build();

        let event = RuleEvent::new("expr_plus", 1, pairs(&[("left", 3), ("right", 4)])).unwrap();
        let result = invoke(&runtime, &parser, event).unwrap();
        assert_eq!(result.as_int(), Some(70));
    }

    #[test]
    fn test_missing_handler_is_fatal() {
        let runtime = NativeRuntime::new();
        let parser = Value::object(Vec::new());

        let event = RuleEvent::new("expr", 0, Vec::new()).unwrap();
        let err = invoke(&runtime, &parser, event).unwrap_err();
        assert_eq!(err, HostError::missing("_handle"));
    }

    #[test]
    fn test_handler_failure_skips_observer() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new()
            .on("expr", |_| Err(HostError::raised("bad expression")))
            .observer(|_| panic!("observer must not run"))
            .build();

        let event = RuleEvent::new("expr", 0, Vec::new()).unwrap();
        let err = invoke(&runtime, &parser, event).unwrap_err();
        assert_eq!(err, HostError::raised("bad expression"));
    }
}
