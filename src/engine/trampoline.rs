//! Native call-back-in
//!
//! The generated parser calls back into the bridge through the two
//! capability tables from [`symbols`](super::symbols). The `extern "C"`
//! functions here recover the [`BridgeContext`] from the table's context
//! pointer, convert the C arguments, and dispatch to
//! [`marshal::invoke`](super::marshal::invoke) and
//! [`relay::fill`](super::relay::fill).
//!
//! Failures cannot travel through C as `Result`s. The first one is stored in
//! the context as the pending error and the trampoline returns null (or
//! zero bytes); the session reports it once the entry point returns.
//! Panics are caught at the boundary and recorded the same way.

use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use super::error::{BridgeError, HostError};
use super::host::HostRuntime;
use super::marshal::{self, RuleEvent};
use super::relay::{self, TruncationPolicy};
use super::symbols::{MarshalerAbi, RawHostRef, RelayAbi};

/// Counters collected while a parse runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Rule events dispatched
    pub events: usize,
    /// Fill requests answered
    pub fills: usize,
    /// Bytes copied into the lexer buffer
    pub bytes_read: usize,
    /// Bytes dropped because they did not fit the buffer
    pub truncated_bytes: usize,
}

/// State shared by the trampolines during one parse run
pub struct BridgeContext<'r, R: HostRuntime> {
    runtime: &'r R,
    policy: TruncationPolicy,
    pending: RefCell<Option<BridgeError>>,
    cleanup_errors: RefCell<Vec<HostError>>,
    stats: Cell<BridgeStats>,
}

impl<'r, R: HostRuntime> BridgeContext<'r, R> {
    /// Create a context for one run
    pub fn new(runtime: &'r R, policy: TruncationPolicy) -> Self {
        Self {
            runtime,
            policy,
            pending: RefCell::new(None),
            cleanup_errors: RefCell::new(Vec::new()),
            stats: Cell::new(BridgeStats::default()),
        }
    }

    /// Capability table for rule events; valid while `self` is alive
    pub fn marshaler_abi(&self) -> MarshalerAbi {
        MarshalerAbi {
            ctx: self as *const Self as *mut c_void,
            invoke: invoke_trampoline::<R>,
            release: release_trampoline::<R>,
            token: token_trampoline::<R>,
        }
    }

    /// Capability table for input; valid while `self` is alive
    pub fn relay_abi(&self) -> RelayAbi {
        RelayAbi {
            ctx: self as *const Self as *mut c_void,
            fill: fill_trampoline::<R>,
        }
    }

    /// Record a failure; the first one wins
    pub fn set_pending(&self, error: BridgeError) {
        let mut pending = self.pending.borrow_mut();
        if pending.is_none() {
            *pending = Some(error);
        }
    }

    /// True when a failure is waiting to be reported
    pub fn has_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }

    /// Take the pending failure, falling back to one held by the runtime
    pub fn take_pending(&self) -> Option<BridgeError> {
        self.pending.borrow_mut().take().or_else(|| {
            self.runtime
                .take_pending_error()
                .map(BridgeError::PendingException)
        })
    }

    /// Counters so far
    pub fn stats(&self) -> BridgeStats {
        self.stats.get()
    }

    /// End-of-input cleanup failures seen so far
    pub fn take_cleanup_errors(&self) -> Vec<HostError> {
        std::mem::take(&mut *self.cleanup_errors.borrow_mut())
    }

    fn update_stats(&self, f: impl FnOnce(&mut BridgeStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Dispatch one rule event coming from native code
    ///
    /// # Safety
    ///
    /// `parser` and every entry of `values` must be live references exported
    /// by this context's runtime; `target` and `names` must be valid C
    /// strings; `names` and `values` must hold `nargs` entries.
    unsafe fn invoke_raw(
        &self,
        parser: RawHostRef,
        target: *const c_char,
        option: c_int,
        nargs: c_int,
        names: *const *const c_char,
        values: *const RawHostRef,
    ) -> Result<RawHostRef, HostError> {
        if self.has_pending() {
            return Err(HostError::raised("previous callback failed"));
        }
        if parser.is_null() || target.is_null() {
            return Err(HostError::raised("null parser or target in rule event"));
        }

        let count = usize::try_from(nargs).unwrap_or(0);
        if count > 0 && (names.is_null() || values.is_null()) {
            return Err(HostError::raised("null argument arrays in rule event"));
        }

        let runtime = self.runtime;
        let parser = runtime.borrow_raw(parser);
        let target = CStr::from_ptr(target).to_string_lossy().into_owned();

        let mut args = Vec::with_capacity(count);
        for i in 0..count {
            let name = *names.add(i);
            let value = *values.add(i);
            if name.is_null() || value.is_null() {
                return Err(HostError::raised(format!(
                    "null argument {} in rule event `{}`",
                    i, target
                )));
            }
            let name = CStr::from_ptr(name).to_string_lossy().into_owned();
            args.push((name, runtime.borrow_raw(value)));
        }

        let event = RuleEvent::new(target, option, args)?;
        let result = marshal::invoke(runtime, &parser, event)?;
        self.update_stats(|s| s.events += 1);
        Ok(runtime.export(result))
    }

    /// Build a host string from lexer text
    ///
    /// # Safety
    ///
    /// `text` must be readable for `len` bytes.
    unsafe fn token_raw(&self, text: *const c_char, len: c_int) -> Result<RawHostRef, HostError> {
        if self.has_pending() {
            return Err(HostError::raised("previous callback failed"));
        }
        let len = usize::try_from(len).unwrap_or(0);
        let bytes = if text.is_null() || len == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(text as *const u8, len)
        };
        let value = self.runtime.new_bytes(bytes)?;
        Ok(self.runtime.export(value))
    }

    /// Answer one fill request coming from native code
    ///
    /// # Safety
    ///
    /// `parser` must be a live reference exported by this context's runtime
    /// and `buf` must be writable for `max_size` bytes.
    unsafe fn fill_raw(&self, parser: RawHostRef, buf: *mut c_char, max_size: c_int) -> c_int {
        if self.has_pending() || parser.is_null() || buf.is_null() || max_size <= 0 {
            return 0;
        }

        let capacity = max_size as usize;
        let buffer = std::slice::from_raw_parts_mut(buf as *mut u8, capacity);
        let parser = self.runtime.borrow_raw(parser);

        match relay::fill(self.runtime, &parser, buffer, self.policy) {
            Ok(outcome) => {
                self.update_stats(|s| {
                    s.fills += 1;
                    s.bytes_read += outcome.written;
                    s.truncated_bytes += outcome.truncated;
                });
                if let Some(e) = outcome.cleanup_error {
                    self.cleanup_errors.borrow_mut().push(e);
                }
                outcome.written as c_int
            }
            Err(e) => {
                self.set_pending(BridgeError::Relay(e));
                0
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in bridge callback".to_string()
    }
}

unsafe extern "C" fn invoke_trampoline<R: HostRuntime>(
    ctx: *mut c_void,
    parser: RawHostRef,
    target: *const c_char,
    option: c_int,
    nargs: c_int,
    names: *const *const c_char,
    values: *const RawHostRef,
) -> RawHostRef {
    if ctx.is_null() {
        return ptr::null_mut();
    }
    let context = &*(ctx as *const BridgeContext<'_, R>);

    let result = catch_unwind(AssertUnwindSafe(|| {
        context.invoke_raw(parser, target, option, nargs, names, values)
    }));

    match result {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            context.set_pending(BridgeError::PendingException(e));
            ptr::null_mut()
        }
        Err(payload) => {
            context.set_pending(BridgeError::PendingException(HostError::raised(
                panic_message(payload),
            )));
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn release_trampoline<R: HostRuntime>(ctx: *mut c_void, value: RawHostRef) {
    if ctx.is_null() || value.is_null() {
        return;
    }
    let context = &*(ctx as *const BridgeContext<'_, R>);
    let runtime = context.runtime;
    let _ = catch_unwind(AssertUnwindSafe(|| runtime.release_raw(value)));
}

unsafe extern "C" fn token_trampoline<R: HostRuntime>(
    ctx: *mut c_void,
    text: *const c_char,
    len: c_int,
) -> RawHostRef {
    if ctx.is_null() {
        return ptr::null_mut();
    }
    let context = &*(ctx as *const BridgeContext<'_, R>);

    match catch_unwind(AssertUnwindSafe(|| context.token_raw(text, len))) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            context.set_pending(BridgeError::PendingException(e));
            ptr::null_mut()
        }
        Err(payload) => {
            context.set_pending(BridgeError::PendingException(HostError::raised(
                panic_message(payload),
            )));
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn fill_trampoline<R: HostRuntime>(
    ctx: *mut c_void,
    parser: RawHostRef,
    buf: *mut c_char,
    max_size: c_int,
) -> c_int {
    if ctx.is_null() {
        return 0;
    }
    let context = &*(ctx as *const BridgeContext<'_, R>);

    match catch_unwind(AssertUnwindSafe(|| context.fill_raw(parser, buf, max_size))) {
        Ok(written) => written,
        Err(payload) => {
            context.set_pending(BridgeError::PendingException(HostError::raised(
                panic_message(payload),
            )));
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::native::{NativeParser, NativeRuntime, Value};
    use std::ffi::CString;

    #[test]
    fn test_invoke_through_abi() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new()
            .on("expr_plus", |call| {
                Ok(Value::int(call.int_arg(0)? + call.int_arg(1)?))
            })
            .build();

        let context = BridgeContext::new(&runtime, TruncationPolicy::Clamp);
        let abi = context.marshaler_abi();

        let raw_parser = runtime.export(parser);
        let left = runtime.export(Value::int(3));
        let right = runtime.export(Value::int(4));
        let target = CString::new("expr_plus").unwrap();
        let n_left = CString::new("left").unwrap();
        let n_right = CString::new("right").unwrap();
        let names = [n_left.as_ptr(), n_right.as_ptr()];
        let values = [left, right];

        let result = unsafe {
            (abi.invoke)(
                abi.ctx,
                raw_parser,
                target.as_ptr(),
                1,
                2,
                names.as_ptr(),
                values.as_ptr(),
            )
        };
        assert!(!result.is_null());
        assert_eq!(unsafe { runtime.borrow_raw(result) }.as_int(), Some(7));
        assert_eq!(context.stats().events, 1);
        assert!(context.take_pending().is_none());

        unsafe {
            (abi.release)(abi.ctx, result);
            runtime.release_raw(left);
            runtime.release_raw(right);
            runtime.release_raw(raw_parser);
        }
    }

    #[test]
    fn test_failed_invoke_leaves_error_pending() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new()
            .on("expr", |_| Err(HostError::raised("division by zero")))
            .build();

        let context = BridgeContext::new(&runtime, TruncationPolicy::Clamp);
        let abi = context.marshaler_abi();
        let raw_parser = runtime.export(parser);
        let target = CString::new("expr").unwrap();

        let result = unsafe {
            (abi.invoke)(
                abi.ctx,
                raw_parser,
                target.as_ptr(),
                0,
                0,
                ptr::null(),
                ptr::null(),
            )
        };
        assert!(result.is_null());
        assert_eq!(
            context.take_pending(),
            Some(BridgeError::PendingException(HostError::raised(
                "division by zero"
            )))
        );

        unsafe { runtime.release_raw(raw_parser) };
    }

    #[test]
    fn test_panicking_handler_does_not_unwind() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new()
            .on("expr", |_| panic!("handler exploded"))
            .build();

        let context = BridgeContext::new(&runtime, TruncationPolicy::Clamp);
        let abi = context.marshaler_abi();
        let raw_parser = runtime.export(parser);
        let target = CString::new("expr").unwrap();

        let result = unsafe {
            (abi.invoke)(
                abi.ctx,
                raw_parser,
                target.as_ptr(),
                0,
                0,
                ptr::null(),
                ptr::null(),
            )
        };
        assert!(result.is_null());
        match context.take_pending() {
            Some(BridgeError::PendingException(HostError::Raised { message })) => {
                assert!(message.contains("handler exploded"))
            }
            other => panic!("unexpected pending state: {:?}", other),
        }

        unsafe { runtime.release_raw(raw_parser) };
    }

    #[test]
    fn test_token_through_abi() {
        let runtime = NativeRuntime::new();
        let context = BridgeContext::new(&runtime, TruncationPolicy::Clamp);
        let abi = context.marshaler_abi();

        let text = b"42+";
        let token = unsafe { (abi.token)(abi.ctx, text.as_ptr() as *const c_char, 2) };
        assert!(!token.is_null());
        assert_eq!(unsafe { runtime.borrow_raw(token) }.as_str(), Some("42"));
        unsafe { (abi.release)(abi.ctx, token) };

        let latin1 = b"caf\xe9";
        let token = unsafe { (abi.token)(abi.ctx, latin1.as_ptr() as *const c_char, 4) };
        let value = unsafe { runtime.borrow_raw(token) };
        assert_eq!(value.as_bytes(), Some(&latin1[..]));
        drop(value);
        unsafe { (abi.release)(abi.ctx, token) };
    }

    #[test]
    fn test_fill_through_abi() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new()
            .read(|_| Ok(Value::str("0123456789")))
            .build();

        let context = BridgeContext::new(&runtime, TruncationPolicy::Clamp);
        let abi = context.relay_abi();
        let raw_parser = runtime.export(parser);

        let mut buf = [0 as c_char; 4];
        let written = unsafe { (abi.fill)(abi.ctx, raw_parser, buf.as_mut_ptr(), 4) };
        assert_eq!(written, 4);

        let stats = context.stats();
        assert_eq!(stats.fills, 1);
        assert_eq!(stats.bytes_read, 4);
        assert_eq!(stats.truncated_bytes, 6);

        unsafe { runtime.release_raw(raw_parser) };
    }
}
