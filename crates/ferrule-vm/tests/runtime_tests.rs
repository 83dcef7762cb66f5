//! Runtime behaviour across calls, errors, hooks and memory limits

use ferrule_vm::{
    open_base, upvalue_index, HookMask, Integer, Limits, State, Status, Type, Value, MULTRET,
    REGISTRY_INDEX,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::os::raw::c_int;

fn message(state: &mut State) -> String {
    state
        .to_bytes(-1)
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
}

fn counter(state: &mut State) -> c_int {
    let n = state.to_integer(upvalue_index(1));
    state.push_integer(n + state.get_top() as Integer);
    1
}

fn returns_args(state: &mut State) -> c_int {
    state.get_top()
}

fn nested_fail(state: &mut State) -> c_int {
    state.push_integer(1);
    state.push_integer(2);
    state.error_message("nested failure")
}

fn quiet_hook(_: &mut State, _: &ferrule_vm::Debug) {}

// ============================================================================
// Calls
// ============================================================================

#[test]
fn test_upvalues_are_visible_through_pseudo_indices() {
    let mut state = State::new();
    state.push_integer(40);
    state.push_closure(counter, 1);
    state.push_nil();
    state.push_nil();
    state.call(2, 1);
    assert_eq!(state.to_integer(-1), 42);
}

#[test]
fn test_missing_upvalue_is_none() {
    fn probe(state: &mut State) -> c_int {
        let ty = state.type_of(upvalue_index(3));
        state.push_boolean(ty == Type::None);
        1
    }
    let mut state = State::new();
    state.push_nil();
    state.push_closure(probe, 1);
    state.call(0, 1);
    assert!(state.to_boolean(-1));
}

#[test]
fn test_pcall_unwinds_nested_frames() {
    fn outer(state: &mut State) -> c_int {
        state.push_function(nested_fail);
        state.call(0, 0);
        0
    }
    let mut state = State::new();
    state.push_string("below");
    state.push_function(outer);
    assert_eq!(state.pcall(0, 0, 0), Status::ErrRun);
    assert_eq!(state.get_top(), 2);
    assert_eq!(message(&mut state), "nested failure");
    assert_eq!(state.depth(), 0);
}

#[test]
fn test_base_pcall_from_foreign_code() {
    let mut state = State::new();
    open_base(&mut state);
    state.get_global("pcall");
    state.push_function(nested_fail);
    state.call(1, MULTRET);
    assert_eq!(state.get_top(), 2);
    assert!(!state.to_boolean(1));
    assert_eq!(message(&mut state), "nested failure");
}

#[test]
fn test_hooks_restored_after_error_in_hook() {
    fn failing_hook(state: &mut State, _: &ferrule_vm::Debug) {
        state.error_message("hook failed");
    }
    let mut state = State::new();
    state.set_hook(
        failing_hook,
        HookMask {
            on_calls: true,
            on_returns: false,
        },
    );
    state.push_function(returns_args);
    assert_eq!(state.pcall(0, 0, 0), Status::ErrRun);
    assert_eq!(message(&mut state), "hook failed");

    state.set_hook(
        quiet_hook,
        HookMask {
            on_calls: true,
            on_returns: true,
        },
    );
    state.pop(1);
    state.push_function(returns_args);
    assert_eq!(state.pcall(0, 0, 0), Status::Ok);
}

// ============================================================================
// Stack limits
// ============================================================================

#[test]
fn test_call_without_min_stack_overflows() {
    fn fill_and_call(state: &mut State) -> c_int {
        while state.check_stack(1) {
            state.push_nil();
        }
        state.push_function(returns_args);
        state.call(0, 0);
        0
    }
    let mut state = State::with_limits(Limits {
        max_stack: 64,
        max_call_depth: 10,
    });
    state.push_function(fill_and_call);
    assert_eq!(state.pcall(0, 0, 0), Status::ErrRun);
    assert_eq!(message(&mut state), "stack overflow");
}

#[test]
fn test_check_stack_or_error_message() {
    fn demand(state: &mut State) -> c_int {
        state.check_stack_or_error(1_000, Some("too much"));
        0
    }
    let mut state = State::with_limits(Limits {
        max_stack: 64,
        max_call_depth: 10,
    });
    state.push_function(demand);
    assert_eq!(state.pcall(0, 0, 0), Status::ErrRun);
    assert_eq!(message(&mut state), "stack overflow (too much)");
}

// ============================================================================
// Userdata and memory
// ============================================================================

#[test]
fn test_userdata_write_respects_reservation() {
    let mut state = State::new();
    let ud = state.new_userdata(8);
    assert!(ud.write(1_u64).is_ok());
    assert_eq!(ud.write([0_u64; 2]), Err([0_u64; 2]));
    assert_eq!(*ud.try_borrow::<u64>().unwrap(), 1);
    assert_eq!(state.raw_len(-1), 8);
}

#[test]
fn test_memory_is_released_when_values_drop() {
    let mut state = State::new();
    let before = state.used_memory();
    state.push_string("some text");
    state.new_table();
    assert!(state.used_memory() > before);
    state.set_top(0);
    assert_eq!(state.used_memory(), before);
}

#[test]
fn test_registry_survives_errors() {
    static KEY: u8 = 0;
    let key = &KEY as *const u8 as *const std::ffi::c_void;
    let mut state = State::new();
    state.push_integer(5);
    state.raw_set_p(REGISTRY_INDEX, key);
    state.push_function(nested_fail);
    assert_eq!(state.pcall(0, 0, 0), Status::ErrRun);
    state.pop(1);
    state.raw_get_p(REGISTRY_INDEX, key);
    assert_eq!(state.value_at(-1), Some(&Value::Integer(5)));
}

proptest! {
    #[test]
    fn prop_call_leaves_only_results(below in 0usize..8, nargs in 0usize..8) {
        let mut state = State::new();
        for i in 0..below {
            state.push_integer(i as Integer);
        }
        state.push_function(returns_args);
        for i in 0..nargs {
            state.push_integer(100 + i as Integer);
        }
        state.call(nargs as c_int, MULTRET);
        prop_assert_eq!(state.get_top() as usize, below + nargs);
        for i in 0..nargs {
            prop_assert_eq!(state.to_integer((below + i + 1) as c_int), 100 + i as Integer);
        }
    }

    #[test]
    fn prop_rotate_is_reversible(len in 1usize..12, n in -12i32..12) {
        let mut state = State::new();
        for i in 0..len {
            state.push_integer(i as Integer);
        }
        state.rotate(1, n);
        state.rotate(1, -n);
        for i in 0..len {
            prop_assert_eq!(state.to_integer(i as c_int + 1), i as Integer);
        }
    }
}
