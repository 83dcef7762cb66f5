//! Native entry points installed into the runtime
//!
//! These functions are called by the runtime, never by host code directly.
//! They may raise foreign errors freely, except on the path that carries a
//! host panic: that payload is never touched beyond reading its metatable.

use super::keys::{self, PayloadKeys};
use super::FAILURE_SENTINEL;
use crate::bridge::ExtraData;
use crate::{hook, util};
use ferrule_config::bridge::{DEFAULT_CLASSIFY_HEADROOM, DEFAULT_TRACEBACK_HEADROOM};
use ferrule_config::BridgeConfig;
use ferrule_vm::{upvalue_index, Debug, State, Type, Value, MULTRET, REGISTRY_INDEX};
use std::ffi::c_void;
use std::os::raw::c_int;

/// Free slots the classifier secures before each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headroom {
    /// Needed to inspect the payload at all
    pub classify: c_int,
    /// Needed to build a traceback string
    pub traceback: c_int,
}

impl Default for Headroom {
    fn default() -> Self {
        Headroom {
            classify: DEFAULT_CLASSIFY_HEADROOM as c_int,
            traceback: DEFAULT_TRACEBACK_HEADROOM as c_int,
        }
    }
}

impl Headroom {
    /// Values past `c_int::MAX` saturate, so an oversized headroom only ever
    /// makes the classifier more cautious.
    pub fn from_config(config: &BridgeConfig) -> Headroom {
        Headroom {
            classify: c_int::try_from(config.classify_headroom()).unwrap_or(c_int::MAX),
            traceback: c_int::try_from(config.traceback_headroom()).unwrap_or(c_int::MAX),
        }
    }
}

// ============================================================================
// Trampolines
// ============================================================================

/// Runs the host callback held in upvalue 1.
///
/// A failure slot is allocated and rotated below the arguments before the
/// callback runs, so reporting a failure never allocates. The callback
/// returns its result count, or [`FAILURE_SENTINEL`] after filling the slot,
/// in which case the slot is raised.
pub fn call_host(state: &mut State) -> c_int {
    let nargs = state.get_top();
    let extra = (2 - nargs).max(0) + 1;
    state.check_stack_or_error(
        extra,
        Some("not enough stack space for callback error handling"),
    );

    state.new_userdata(keys::failure_slot_size());
    state.rotate(1, 1);

    let callback = match state.value_at(upvalue_index(1)) {
        Some(Value::NativeFunction(f)) => *f,
        _ => state.error_message("host callback is missing"),
    };

    let ret = callback(state);
    if ret == FAILURE_SENTINEL {
        state.error();
    }
    ret
}

/// Hook entry point with the same failure slot discipline as [`call_host`].
pub fn call_hook_proc(state: &mut State, ar: &Debug) {
    state.check_stack_or_error(2, Some("not enough stack space for callback error handling"));
    state.new_userdata(keys::failure_slot_size());
    state.rotate(1, 1);
    if hook::hook_proc(state, ar) == FAILURE_SENTINEL {
        state.error();
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Whether the value at `idx` is a userdata whose metatable is the one
/// registered under `key`. Uses 2 slots.
pub fn is_wrapped_struct(state: &mut State, idx: c_int, key: Option<*const c_void>) -> bool {
    let key = match key {
        Some(key) => key,
        None => return false,
    };
    if state.to_userdata(idx).is_none() || !state.get_metatable(idx) {
        return false;
    }
    state.raw_get_p(REGISTRY_INDEX, key);
    let res = state.raw_equal(-1, -2);
    state.pop(2);
    res
}

/// Message handler of every protected call made by the bridge.
///
/// Recoverable host errors get a traceback through the finalizer, host
/// panics pass through untouched, other values are stringified with a
/// traceback appended when there is room.
pub fn error_traceback(state: &mut State) -> c_int {
    let headroom = state
        .extra::<ExtraData>()
        .map(|extra| extra.headroom)
        .unwrap_or_default();
    classify(state, PayloadKeys::current(), headroom)
}

pub(crate) fn classify(state: &mut State, keys: PayloadKeys, headroom: Headroom) -> c_int {
    if !state.check_stack(headroom.classify) {
        return 1;
    }

    if is_wrapped_struct(state, -1, keys.error) {
        let error_idx = state.abs_index(-1);
        let has_traceback = state.check_stack(headroom.classify.saturating_add(headroom.traceback));
        let slot = state.new_userdata(keys::wrapped_error_size());
        if has_traceback {
            state.traceback(1, None);
        }
        util::wrapped_error_traceback(state, error_idx, &slot, has_traceback);
        return 1;
    }

    if keys.panic.is_some()
        && !is_wrapped_struct(state, -1, keys.panic)
        && state.check_stack(headroom.traceback)
    {
        let msg = state.to_display_string(-1).to_string_lossy();
        state.traceback(1, Some(&msg));
        state.remove(-2);
    }

    1
}

// ============================================================================
// Metatable dispatch
// ============================================================================

fn field_name(state: &mut State, idx: c_int) -> String {
    match state.to_bytes(idx) {
        Some(s) => s.to_string_lossy(),
        None => util::to_string(state, idx),
    }
}

/// `__index` over the upvalues `[base __index, getters, methods]`.
///
/// A getter is called with the object, a method is returned as is, anything
/// else goes to the base `__index`.
pub fn meta_index_impl(state: &mut State) -> c_int {
    // stack: self, key
    state.check_stack_or_error(2, None);

    if !state.is_nil(upvalue_index(2)) {
        state.push_value(-1);
        if state.raw_get(upvalue_index(2)) != Type::Nil {
            state.insert(-3);
            state.pop(1);
            state.call(1, 1);
            return 1;
        }
        state.pop(1);
    }

    if !state.is_nil(upvalue_index(3)) {
        state.push_value(-1);
        if state.raw_get(upvalue_index(3)) != Type::Nil {
            state.insert(-3);
            state.pop(2);
            return 1;
        }
        state.pop(1);
    }

    state.push_value(upvalue_index(1));
    match state.type_of(-1) {
        Type::Nil => {
            state.pop(1);
            let field = field_name(state, -1);
            state.error_message(format!("attempt to get an unknown field '{}'", field))
        }
        Type::Table => {
            state.insert(-2);
            state.get_table(-2);
        }
        Type::Function => {
            state.insert(-3);
            state.call(2, 1);
        }
        _ => {}
    }
    1
}

/// `__newindex` over the upvalues `[base __newindex, setters]`.
pub fn meta_newindex_impl(state: &mut State) -> c_int {
    // stack: self, key, value
    state.check_stack_or_error(2, None);

    state.push_value(-2);
    if state.raw_get(upvalue_index(2)) != Type::Nil {
        state.remove(-3);
        state.insert(-3);
        state.call(2, 0);
        return 0;
    }
    state.pop(1);

    state.push_value(upvalue_index(1));
    match state.type_of(-1) {
        Type::Nil => {
            state.pop(1);
            let field = field_name(state, -2);
            state.error_message(format!("attempt to set an unknown field '{}'", field))
        }
        Type::Table => {
            state.insert(-3);
            state.set_table(-3);
        }
        Type::Function => {
            state.insert(-4);
            state.call(3, 0);
        }
        _ => {}
    }
    0
}

/// Calls upvalue 1 with the bound upvalues `3..` followed by the call's own
/// arguments. Upvalue 2 holds the number of bound values.
pub fn bind_call_impl(state: &mut State) -> c_int {
    let nargs = state.get_top();
    let nbinds = state.to_integer(upvalue_index(2)) as c_int;
    state.check_stack_or_error(nbinds + 2, None);

    state.set_top(nargs + nbinds + 1);
    state.rotate(-(nargs + nbinds + 1), nbinds + 1);

    state.push_value(upvalue_index(1));
    state.replace(1);

    for i in 0..nbinds {
        state.push_value(upvalue_index(i + 3));
        state.replace(i + 2);
    }

    state.call(nargs + nbinds, MULTRET);
    state.get_top()
}
