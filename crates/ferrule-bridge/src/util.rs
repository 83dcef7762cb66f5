//! Stack discipline and error plumbing shared by the bridge
//!
//! Host code talks to the runtime through short stack-balanced sequences:
//! push the inputs, run a primitive under [`protect_lua_call`], read the
//! result, pop. Foreign code calls back into the host through the
//! trampoline, which hands control to [`callback_error`] so that neither host
//! errors nor host panics ever escape as an unwind through foreign frames.

use crate::error::{Error, Result};
use crate::ffi::{self, keys, shim};
use ferrule_vm::{NativeFn, State, Status, Throw, Type, UserDataRef, Value, MULTRET, REGISTRY_INDEX};
use std::any::Any;
use std::ffi::c_void;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::os::raw::c_int;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Recoverable host error parked in a failure slot.
pub(crate) struct WrappedError(pub(crate) Error);

/// Host panic payload parked in a failure slot. `None` once resumed.
pub(crate) struct WrappedPanic(pub(crate) Option<Box<dyn Any + Send + 'static>>);

/// Traceback text used when the stack had no room to build one.
pub(crate) const NO_TRACEBACK: &str = "<not enough stack space for traceback>";

// ============================================================================
// Stack guard
// ============================================================================

/// Restores the stack top on drop, keeping `extra` values from the top.
///
/// Popping below the recorded top is a logic error and panics, unless the
/// thread is already unwinding.
pub(crate) struct StackGuard<'a> {
    state: &'a mut State,
    top: c_int,
    extra: c_int,
}

impl<'a> StackGuard<'a> {
    pub(crate) fn new(state: &'a mut State) -> StackGuard<'a> {
        Self::new_extra(state, 0)
    }

    pub(crate) fn new_extra(state: &'a mut State, extra: c_int) -> StackGuard<'a> {
        let top = state.get_top();
        StackGuard { state, top, extra }
    }
}

impl Deref for StackGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        self.state
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        self.state
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        let expected = self.top + self.extra;
        let top = self.state.get_top();
        if top < expected {
            if !std::thread::panicking() {
                panic!("{} too many stack values popped", expected - top);
            }
            return;
        }
        if top > expected {
            if self.extra > 0 {
                self.state.rotate(self.top + 1, self.extra);
            }
            self.state.set_top(expected);
        }
    }
}

/// Fails with [`Error::StackError`] unless `amount` more slots are free.
pub(crate) fn check_stack(state: &State, amount: c_int) -> Result<()> {
    if state.check_stack(amount) {
        Ok(())
    } else {
        Err(Error::StackError)
    }
}

// ============================================================================
// Protected calls
// ============================================================================

/// Runs `f` on the top `nargs` values inside a protected call.
///
/// The primitive sees only its arguments; every result it returns stays on
/// the stack. The classifier is installed as message handler. Uses 2 extra
/// slots on top of what `f` needs.
pub(crate) fn protect_lua_call(state: &mut State, nargs: c_int, f: NativeFn) -> Result<()> {
    let stack_start = state.get_top() - nargs;

    state.push_function(shim::error_traceback);
    state.push_function(f);
    if nargs > 0 {
        state.rotate(stack_start + 1, 2);
    }

    let status = state.pcall(nargs, MULTRET, stack_start + 1);
    state.remove(stack_start + 1);

    if status.is_ok() {
        Ok(())
    } else {
        let err = pop_error(state, status);
        tracing::trace!(status = ?status, error = %err, "protected primitive failed");
        Err(err)
    }
}

/// Pops the error value left by a failed protected call.
///
/// A wrapped host error is returned as is, a wrapped host panic is resumed,
/// anything else becomes an error matching `status`.
pub(crate) fn pop_error(state: &mut State, status: Status) -> Error {
    debug_assert!(!status.is_ok(), "pop_error called without an error");

    if let Some(err) = get_wrapped_error(state, -1) {
        state.pop(1);
        return err;
    }

    if let Some(ud) = wrapped_panic_at(state, -1) {
        state.pop(1);
        let payload = ud
            .try_borrow_mut::<WrappedPanic>()
            .ok()
            .and_then(|mut panic| panic.0.take());
        return match payload {
            Some(p) => resume_unwind(p),
            None => Error::PreviouslyResumedPanic,
        };
    }

    let message = to_string(state, -1);
    state.pop(1);
    match status {
        Status::ErrMem => Error::MemoryError(message),
        Status::ErrErr => Error::ErrorInErrorHandling(message),
        Status::ErrRun | Status::Ok => Error::RuntimeError(message),
    }
}

// ============================================================================
// Host callbacks
// ============================================================================

/// Runs a host callback on behalf of the trampoline.
///
/// Index 1 holds the failure slot, the arguments follow it. On success the
/// slot is removed and the callback's result count is returned. A host error
/// or panic is written into the slot, the stack is cut down to it and
/// [`ffi::FAILURE_SENTINEL`] is returned; the trampoline then raises the slot.
///
/// A raise that started inside the callback passes through untouched.
pub(crate) fn callback_error<F>(state: &mut State, f: F) -> c_int
where
    F: FnOnce(&mut State, c_int) -> Result<c_int>,
{
    let nargs = state.get_top() - 1;
    match catch_unwind(AssertUnwindSafe(|| f(state, nargs))) {
        Ok(Ok(r)) => {
            state.remove(1);
            r
        }
        Ok(Err(err)) => {
            fill_failure_slot(state, WrappedError(err), keys::wrapped_error_key());
            ffi::FAILURE_SENTINEL
        }
        Err(p) if p.is::<Throw>() => resume_unwind(p),
        Err(p) => {
            fill_failure_slot(state, WrappedPanic(Some(p)), keys::wrapped_panic_key());
            ffi::FAILURE_SENTINEL
        }
    }
}

fn fill_failure_slot<T: Any>(state: &mut State, payload: T, key: Option<*const c_void>) {
    state.set_top(1);
    let slot = match state.to_userdata(1) {
        Some(slot) => slot,
        None => panic!("failure slot is missing"),
    };
    if slot.write(payload).is_err() {
        panic!("failure slot is too small for the payload");
    }
    if let Some(key) = key {
        state.raw_get_p(REGISTRY_INDEX, key);
        state.set_metatable(-2);
    }
}

/// Finalizer for recoverable errors seen by the classifier.
///
/// Converts the wrapped error at `error_idx` into a callback error stored in
/// `slot`, taking the traceback from the top of the stack when
/// `has_traceback` is set. Leaves `slot` where the original error was.
pub(crate) fn wrapped_error_traceback(
    state: &mut State,
    error_idx: c_int,
    slot: &UserDataRef,
    has_traceback: bool,
) {
    let traceback = if has_traceback {
        let traceback = to_string(state, -1);
        state.pop(1);
        traceback
    } else {
        tracing::warn!("not enough stack space to attach a traceback");
        NO_TRACEBACK.to_string()
    };

    let cause = match state
        .to_userdata(error_idx)
        .and_then(|ud| ud.try_borrow::<WrappedError>().ok().map(|e| e.0.clone()))
    {
        Some(cause) => cause,
        None => panic!("cannot get <WrappedError>"),
    };

    state.remove(error_idx);
    let wrapped = WrappedError(Error::CallbackError {
        traceback,
        cause: Arc::new(cause),
    });
    if slot.write(wrapped).is_err() {
        panic!("failure slot is too small for the payload");
    }
    if let Some(key) = keys::wrapped_error_key() {
        state.raw_get_p(REGISTRY_INDEX, key);
        state.set_metatable(-2);
    }
}

// ============================================================================
// Wrapped payloads
// ============================================================================

fn wrapped_panic_at(state: &mut State, idx: c_int) -> Option<UserDataRef> {
    if shim::is_wrapped_struct(state, idx, keys::wrapped_panic_key()) {
        state.to_userdata(idx)
    } else {
        None
    }
}

/// The host error wrapped by the value at `idx`, if it is one. Uses 2 slots.
pub(crate) fn get_wrapped_error(state: &mut State, idx: c_int) -> Option<Error> {
    if !shim::is_wrapped_struct(state, idx, keys::wrapped_error_key()) {
        return None;
    }
    let ud = state.to_userdata(idx)?;
    let err = ud.try_borrow::<WrappedError>().ok()?;
    Some(err.0.clone())
}

/// Pushes `err` as a wrapped error value. Uses 3 slots.
pub(crate) fn push_wrapped_error(state: &mut State, err: Error) -> Result<()> {
    let key = keys::wrapped_error_key().ok_or_else(|| Error::runtime("error registry is not initialized"))?;
    let slot = ffi::safe::new_userdata(state, keys::wrapped_error_size())?;
    if let Err(WrappedError(err)) = slot.write(WrappedError(err)) {
        state.pop(1);
        return Err(err);
    }
    state.raw_get_p(REGISTRY_INDEX, key);
    state.set_metatable(-2);
    Ok(())
}

/// Builds the payload metatables and registers both payload kinds.
///
/// Uses 4 slots.
pub(crate) fn init_error_registry(state: &mut State) -> Result<()> {
    check_stack(state, 4)?;

    keys::register_wrapped_error(mem::size_of::<WrappedError>());
    keys::register_wrapped_panic(mem::size_of::<WrappedPanic>());

    for (key, name) in [
        (keys::wrapped_error_key(), "WrappedError"),
        (keys::wrapped_panic_key(), "WrappedPanic"),
    ] {
        let key = match key {
            Some(key) => key,
            None => return Err(Error::runtime("payload key was not registered")),
        };
        ffi::safe::create_table(state, 0, 2)?;
        ffi::safe::push_rust_function(state, error_tostring)?;
        ffi::safe::raw_set_field(state, -2, "__tostring")?;
        ffi::safe::push_string(state, name)?;
        ffi::safe::raw_set_field(state, -2, "__name")?;
        ffi::safe::raw_set_p(state, REGISTRY_INDEX, key)?;
    }
    Ok(())
}

/// `__tostring` of both payload kinds.
fn error_tostring(state: &mut State) -> c_int {
    callback_error(state, |state, _| {
        check_stack(state, 3)?;

        let text = if let Some(err) = get_wrapped_error(state, -1) {
            err.to_string()
        } else if let Some(ud) = wrapped_panic_at(state, -1) {
            let panic = ud
                .try_borrow::<WrappedPanic>()
                .map_err(|_| Error::UserDataTypeMismatch)?;
            match &panic.0 {
                Some(p) => panic_message(p.as_ref()),
                None => return Err(Error::PreviouslyResumedPanic),
            }
        } else {
            return Err(Error::UserDataTypeMismatch);
        };

        ffi::safe::push_string(state, &text)?;
        Ok(1)
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<panic>".to_string()
    }
}

/// Printable form of any value. Never raises and never calls metamethods.
pub(crate) fn to_string(state: &State, idx: c_int) -> String {
    match state.value_at(idx) {
        None => "<none>".to_string(),
        Some(Value::Nil) => "<nil>".to_string(),
        Some(Value::Boolean(b)) => b.to_string(),
        Some(Value::Integer(i)) => i.to_string(),
        Some(Value::Number(n)) => ferrule_vm::value::format_number(*n),
        Some(Value::String(s)) => s.to_string_lossy(),
        Some(Value::LightUserData(p)) => format!("<lightuserdata {:?}>", p),
        Some(other) => {
            let kind = match other.type_of() {
                Type::Table => "table",
                Type::Function => "function",
                _ => "userdata",
            };
            format!("<{} {:?}>", kind, other.to_pointer())
        }
    }
}
