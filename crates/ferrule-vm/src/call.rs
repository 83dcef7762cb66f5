//! Calls, protected calls and error raising
//!
//! Raising an error is a non-local transfer implemented with unwinding. The
//! raised value is parked in the state and a [`Throw`] payload unwinds the
//! host stack up to the innermost [`State::pcall`], which restores the frame
//! bookkeeping and pushes the error value.
//!
//! The message handler of the innermost protected call runs at the raise
//! site, before unwinding, so it can still inspect the erroring frames.

use crate::config::{ERROR_CALL_RESERVE, ERROR_STACK_RESERVE, MIN_STACK, MULTRET};
use crate::debug::HookEvent;
use crate::state::{CallInfo, FrameKind, Protection, State};
use crate::value::{StringRef, Value};
use std::os::raw::c_int;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

/// Result of a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    /// A runtime error
    ErrRun,
    /// Allocation failure; the message handler is not called
    ErrMem,
    /// An error raised while running the message handler
    ErrErr,
}

impl Status {
    pub const fn code(self) -> c_int {
        match self {
            Status::Ok => 0,
            Status::ErrRun => 2,
            Status::ErrMem => 4,
            Status::ErrErr => 5,
        }
    }

    pub const fn from_code(code: c_int) -> Option<Status> {
        match code {
            0 => Some(Status::Ok),
            2 => Some(Status::ErrRun),
            4 => Some(Status::ErrMem),
            5 => Some(Status::ErrErr),
            _ => None,
        }
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Unwinding payload that carries a raised error to the nearest protected call.
///
/// Host code that catches unwinds itself must resume this payload unchanged.
#[derive(Debug)]
pub struct Throw;

struct SavedFrames {
    frames: usize,
    allow_hook: bool,
    handling_error: bool,
}

impl State {
    /// Calls the function below the top `nargs` values.
    ///
    /// Function and arguments are replaced by `nresults` results, or all of
    /// them with [`MULTRET`]. Errors propagate to the enclosing protected call.
    pub fn call(&mut self, nargs: c_int, nresults: c_int) {
        let func = self.func_slot(nargs);
        self.call_at(func, nresults);
    }

    /// Calls like [`State::call`], catching any raised error.
    ///
    /// On error the function and arguments are replaced by the error value.
    /// When `msgh` is non-zero, the function at that index is the message
    /// handler: it receives the error value at the raise site and its result
    /// becomes the error value.
    pub fn pcall(&mut self, nargs: c_int, nresults: c_int, msgh: c_int) -> Status {
        let func = self.func_slot(nargs);
        let handler = (msgh != 0).then(|| self.get(msgh));
        let saved = SavedFrames {
            frames: self.frames.len(),
            allow_hook: self.allow_hook,
            handling_error: self.handling_error,
        };

        self.protected.push(Protection { handler });
        let result = catch_unwind(AssertUnwindSafe(|| self.call_at(func, nresults)));
        self.protected.pop();

        let payload = match result {
            Ok(()) => return Status::Ok,
            Err(payload) => payload,
        };

        self.frames.truncate(saved.frames);
        self.allow_hook = saved.allow_hook;
        self.handling_error = saved.handling_error;
        self.stack.truncate(func);

        if !payload.is::<Throw>() {
            resume_unwind(payload);
        }
        let (status, value) = self
            .pending
            .take()
            .unwrap_or((Status::ErrRun, Value::Nil));
        self.stack.push(value);
        status
    }

    /// Raises the value on top of the stack as an error.
    pub fn error(&mut self) -> ! {
        let value = if self.get_top() > 0 {
            self.stack.pop().unwrap_or_default()
        } else {
            Value::Nil
        };
        self.throw(Status::ErrRun, value)
    }

    /// Raises a string error.
    pub fn error_message(&mut self, msg: impl AsRef<str>) -> ! {
        let s = self.new_string(msg.as_ref().as_bytes());
        self.throw(Status::ErrRun, Value::String(s))
    }

    pub(crate) fn throw(&mut self, status: Status, value: Value) -> ! {
        if self.protected.is_empty() {
            panic!(
                "unprotected error in call to foreign API ({})",
                describe(&value)
            );
        }
        let (status, value) = match status {
            Status::ErrRun => self.run_message_handler(value),
            other => (other, value),
        };
        tracing::trace!(status = ?status, "raising error");
        self.pending = Some((status, value));
        resume_unwind(Box::new(Throw))
    }

    fn run_message_handler(&mut self, value: Value) -> (Status, Value) {
        if self.handling_error {
            return (Status::ErrErr, value);
        }
        let handler = match self.protected.last().and_then(|p| p.handler.clone()) {
            Some(handler) => handler,
            None => return (Status::ErrRun, value),
        };

        self.handling_error = true;
        let func = self.stack.len();
        self.stack.push(handler);
        self.stack.push(value);
        self.call_at(func, 1);
        self.handling_error = false;

        (Status::ErrRun, self.stack.pop().unwrap_or_default())
    }

    fn func_slot(&self, nargs: c_int) -> usize {
        let nargs = usize::try_from(nargs).unwrap_or(0);
        let available = self.stack.len() - self.base();
        assert!(nargs < available, "not enough values on the stack for call");
        self.stack.len() - nargs - 1
    }

    pub(crate) fn call_at(&mut self, func: usize, nresults: c_int) {
        let callee = self.stack[func].clone();
        let f = match &callee {
            Value::Function(closure) => closure.0.func,
            Value::NativeFunction(f) => *f,
            other => {
                let handler = self.metafield(other, &self.names.call);
                if handler.is_callable() {
                    self.stack.insert(func, handler);
                    return self.call_at(func, nresults);
                }
                self.error_message(format!("attempt to call a {} value", other.type_name()))
            }
        };

        let (depth_reserve, stack_reserve) = if self.handling_error {
            (ERROR_CALL_RESERVE, ERROR_STACK_RESERVE)
        } else {
            (0, 0)
        };
        if self.depth() >= self.limits.max_call_depth + depth_reserve
            || self.stack.len() + MIN_STACK > self.limits.max_stack + stack_reserve
        {
            self.error_message("stack overflow");
        }

        self.frames.push(CallInfo {
            base: func + 1,
            callee,
            kind: FrameKind::Native,
        });
        self.run_hook(HookEvent::Call);
        let n = f(self);
        self.run_hook(HookEvent::Return);
        self.frames.pop();

        let n = match usize::try_from(n) {
            Ok(n) if n < self.stack.len() - func => n,
            _ => panic!("native function returned an invalid result count ({})", n),
        };
        let first = self.stack.len() - n;
        self.stack.drain(func..first);
        if nresults != MULTRET {
            self.stack
                .resize(func + usize::try_from(nresults).unwrap_or(0), Value::Nil);
        }
    }

    /// Metatable field of a value, nil if absent.
    pub(crate) fn metafield(&self, value: &Value, name: &StringRef) -> Value {
        value
            .metatable()
            .map(|mt| mt.borrow().get(&Value::String(name.clone())))
            .unwrap_or_default()
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string_lossy(),
        other => format!("error object is a {} value", other.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use pretty_assertions::assert_eq;

    fn add(state: &mut State) -> c_int {
        let sum = state.to_integer(1) + state.to_integer(2);
        state.push_integer(sum);
        1
    }

    fn fail(state: &mut State) -> c_int {
        state.error_message("boom")
    }

    fn recurse(state: &mut State) -> c_int {
        state.push_function(recurse);
        state.call(0, 0);
        0
    }

    fn prefix_handler(state: &mut State) -> c_int {
        let msg = state.to_bytes(1).map(|s| s.to_string_lossy()).unwrap_or_default();
        state.push_string(format!("handled: {}", msg));
        1
    }

    fn failing_handler(state: &mut State) -> c_int {
        state.error_message("handler failed")
    }

    #[test]
    fn test_call_replaces_function_and_arguments() {
        let mut state = State::new();
        state.push_integer(100);
        state.push_function(add);
        state.push_integer(2);
        state.push_integer(3);
        state.call(2, 1);
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_integer(-1), 5);
        assert_eq!(state.to_integer(1), 100);
    }

    #[test]
    fn test_call_pads_results() {
        let mut state = State::new();
        state.push_function(add);
        state.push_integer(1);
        state.push_integer(1);
        state.call(2, 3);
        assert_eq!(state.get_top(), 3);
        assert!(state.is_nil(3));
    }

    #[test]
    fn test_pcall_catches_error() {
        let mut state = State::new();
        state.push_function(fail);
        let status = state.pcall(0, 0, 0);
        assert_eq!(status, Status::ErrRun);
        assert_eq!(state.get_top(), 1);
        assert_eq!(state.to_bytes(-1).unwrap().as_bytes(), b"boom");
        assert_eq!(state.depth(), 0);
    }

    #[test]
    fn test_message_handler_transforms_error() {
        let mut state = State::new();
        state.push_function(prefix_handler);
        state.push_function(fail);
        let status = state.pcall(0, 0, 1);
        assert_eq!(status, Status::ErrRun);
        assert_eq!(
            state.to_bytes(-1).unwrap().to_string_lossy(),
            "handled: boom"
        );
    }

    #[test]
    fn test_error_in_handler_is_errerr() {
        let mut state = State::new();
        state.push_function(failing_handler);
        state.push_function(fail);
        let status = state.pcall(0, 0, 1);
        assert_eq!(status, Status::ErrErr);
        assert_eq!(
            state.to_bytes(-1).unwrap().to_string_lossy(),
            "handler failed"
        );
        assert!(!state.handling_error);
    }

    #[test]
    fn test_call_depth_limit() {
        let mut state = State::with_limits(Limits {
            max_call_depth: 8,
            ..Limits::default()
        });
        state.push_function(recurse);
        let status = state.pcall(0, 0, 0);
        assert_eq!(status, Status::ErrRun);
        assert_eq!(
            state.to_bytes(-1).unwrap().to_string_lossy(),
            "stack overflow"
        );
    }

    #[test]
    fn test_calling_non_function() {
        let mut state = State::new();
        state.push_integer(1);
        let status = state.pcall(0, 0, 0);
        assert_eq!(status, Status::ErrRun);
        assert_eq!(
            state.to_bytes(-1).unwrap().to_string_lossy(),
            "attempt to call a number value"
        );
    }

    #[test]
    fn test_memory_error_skips_handler() {
        fn allocate(state: &mut State) -> c_int {
            state.push_string("x".repeat(1024));
            1
        }
        let mut state = State::new();
        state.set_memory_limit(Some(state.used_memory() + 64));
        state.push_function(prefix_handler);
        state.push_function(allocate);
        let status = state.pcall(0, 1, 1);
        assert_eq!(status, Status::ErrMem);
        assert_eq!(
            state.to_bytes(-1).unwrap().to_string_lossy(),
            "not enough memory"
        );
    }

    #[test]
    #[should_panic(expected = "unprotected error")]
    fn test_unprotected_error_panics() {
        let mut state = State::new();
        state.push_function(fail);
        state.call(0, 0);
    }

    #[test]
    fn test_status_codes() {
        for status in [Status::Ok, Status::ErrRun, Status::ErrMem, Status::ErrErr] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(1), None);
    }
}
