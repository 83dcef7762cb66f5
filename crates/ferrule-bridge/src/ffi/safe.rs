//! Protected stack primitives
//!
//! Every operation that may raise a foreign error (allocation, metamethods,
//! invalid keys) is split in two: a native `*_s` function with a fixed stack
//! contract that runs inside a protected call, and a host wrapper that pushes
//! its inputs, runs it through [`protect_lua_call`] and returns a `Result`.
//!
//! The slot counts in the comments are what the wrapper needs on top of the
//! stack it was given, not counting the frame of the protected call.

use super::shim;
use crate::error::{Error, Result};
use crate::util::protect_lua_call;
use ferrule_vm::{Integer, NativeFn, State, StringRef, Type, UserDataRef, Value};
use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

/// Borrowed bytes passed to the runtime as a light userdata, so strings are
/// copied by length and may contain NUL bytes.
#[repr(C)]
struct StringArg {
    data: *const u8,
    len: usize,
}

impl StringArg {
    fn new(s: &[u8]) -> StringArg {
        StringArg {
            data: s.as_ptr(),
            len: s.len(),
        }
    }
}

fn push_string_arg(state: &mut State, arg: &StringArg) {
    state.push_light_userdata(arg as *const StringArg as *mut c_void);
}

/// Reads a descriptor pushed by [`push_string_arg`].
fn string_arg_bytes(state: &State, idx: c_int) -> Vec<u8> {
    let arg = state.to_light_userdata(idx) as *const StringArg;
    assert!(!arg.is_null(), "string descriptor expected");
    // SAFETY: the descriptor and the bytes it points to live on the host
    // stack frame of the wrapper that is waiting for this primitive.
    unsafe {
        let arg = &*arg;
        slice::from_raw_parts(arg.data, arg.len).to_vec()
    }
}

fn pop_integer(state: &mut State) -> Integer {
    let n = state.to_integer(-1);
    state.pop(1);
    n
}

// ============================================================================
// Native halves
// ============================================================================

fn push_lstring_s(state: &mut State) -> c_int {
    let bytes = string_arg_bytes(state, -1);
    state.pop(1);
    state.push_string(bytes);
    1
}

fn to_lstring_s(state: &mut State) -> c_int {
    state.to_bytes(-1);
    1
}

fn new_userdata_s(state: &mut State) -> c_int {
    let size = usize::try_from(pop_integer(state)).unwrap_or(0);
    state.new_userdata(size);
    1
}

fn push_closure_s(state: &mut State) -> c_int {
    let n = state.get_top() - 1;
    let f = match state.value_at(-1) {
        Some(Value::NativeFunction(f)) => *f,
        _ => state.error_message("native function expected"),
    };
    state.pop(1);
    state.push_closure(f, n);
    1
}

fn push_rust_closure_s(state: &mut State) -> c_int {
    let n = state.get_top();
    state.push_closure(shim::call_host, n);
    1
}

fn error_traceback_s(state: &mut State) -> c_int {
    shim::error_traceback(state)
}

fn create_table_s(state: &mut State) -> c_int {
    let nrec = pop_integer(state) as c_int;
    let narr = pop_integer(state) as c_int;
    state.create_table(narr, nrec);
    1
}

fn get_table_s(state: &mut State) -> c_int {
    state.get_table(-2);
    1
}

fn set_table_s(state: &mut State) -> c_int {
    state.set_table(-3);
    0
}

fn geti_s(state: &mut State) -> c_int {
    let i = pop_integer(state);
    state.geti(-1, i);
    1
}

fn raw_set_s(state: &mut State) -> c_int {
    state.raw_set(-3);
    0
}

fn raw_seti_s(state: &mut State) -> c_int {
    let i = pop_integer(state);
    state.raw_set_i(-2, i);
    0
}

fn raw_setp_s(state: &mut State) -> c_int {
    let p = state.to_light_userdata(-1);
    state.pop(1);
    state.raw_set_p(-2, p);
    0
}

fn raw_set_field_s(state: &mut State) -> c_int {
    // stack: table, value, name
    let bytes = string_arg_bytes(state, -1);
    state.pop(1);
    state.push_string(bytes);
    state.insert(-2);
    state.raw_set(-3);
    0
}

fn raw_insert_s(state: &mut State) -> c_int {
    // stack: table, value, index
    let index = pop_integer(state);
    let size = state.raw_len(-2) as Integer;

    let mut i = size;
    while i >= index {
        state.raw_get_i(-2, i);
        state.raw_set_i(-3, i + 1);
        i -= 1;
    }
    state.raw_set_i(-2, index);
    0
}

fn raw_remove_s(state: &mut State) -> c_int {
    // stack: table, index
    let index = pop_integer(state);
    let size = state.raw_len(-1) as Integer;

    for i in index..size {
        state.raw_get_i(-1, i + 1);
        state.raw_set_i(-2, i);
    }
    state.push_nil();
    state.raw_set_i(-2, size);
    0
}

fn len_s(state: &mut State) -> c_int {
    state.len(-1);
    if state.to_integerx(-1).is_none() {
        state.error_message("object length is not an integer");
    }
    1
}

fn next_s(state: &mut State) -> c_int {
    let ret = state.next(-2) as Integer;
    state.push_integer(ret);
    if ret == 0 {
        1
    } else {
        3
    }
}

// ============================================================================
// Common functions
// ============================================================================

/// Pushes a copy of `s`. Uses 3 stack spaces.
pub fn push_string(state: &mut State, s: impl AsRef<[u8]>) -> Result<()> {
    let arg = StringArg::new(s.as_ref());
    push_string_arg(state, &arg);
    protect_lua_call(state, 1, push_lstring_s)
}

/// Converts the value at `idx` to a string in place, numbers included.
/// Returns `None` for other types. Uses 3 stack spaces.
pub fn to_string(state: &mut State, idx: c_int) -> Result<Option<StringRef>> {
    let idx = state.abs_index(idx);
    state.push_value(idx);
    protect_lua_call(state, 1, to_lstring_s)?;
    let s = state.value_at(-1).and_then(Value::as_string).cloned();
    state.replace(idx);
    Ok(s)
}

/// Pushes a userdata block of `size` bytes. Uses 3 stack spaces.
pub fn new_userdata(state: &mut State, size: usize) -> Result<UserDataRef> {
    state.push_integer(size as Integer);
    protect_lua_call(state, 1, new_userdata_s)?;
    state.to_userdata(-1).ok_or(Error::UserDataTypeMismatch)
}

/// Pops `n` values and pushes a native closure capturing them. Uses 3 stack spaces.
pub fn push_closure(state: &mut State, f: NativeFn, n: c_int) -> Result<()> {
    state.push_function(f);
    protect_lua_call(state, n + 1, push_closure_s)
}

/// Pops `n` values and pushes a closure running the host callback `f` through
/// the trampoline. `f` becomes upvalue 1, the popped values follow it.
/// Uses 3 stack spaces.
pub fn push_rust_closure(state: &mut State, f: NativeFn, n: c_int) -> Result<()> {
    state.push_function(f);
    if n > 0 {
        state.rotate(-n - 1, 1);
    }
    protect_lua_call(state, n + 1, push_rust_closure_s)
}

/// Shortcut for a host callback without extra upvalues.
pub fn push_rust_function(state: &mut State, f: NativeFn) -> Result<()> {
    push_rust_closure(state, f, 0)
}

/// Replaces the error value on top with what the message handler makes of
/// it. Uses 2 stack spaces.
pub fn error_traceback(state: &mut State) -> Result<()> {
    protect_lua_call(state, 1, error_traceback_s)
}

// ============================================================================
// Table functions
// ============================================================================

/// Uses 4 stack spaces.
pub fn create_table(state: &mut State, narr: c_int, nrec: c_int) -> Result<()> {
    state.push_integer(narr as Integer);
    state.push_integer(nrec as Integer);
    protect_lua_call(state, 2, create_table_s)
}

/// Replaces the key on top with `t[key]`, honouring metamethods. Uses 3 stack spaces.
pub fn get_table(state: &mut State, table: c_int) -> Result<Type> {
    state.push_value(table);
    state.rotate(-2, 1);
    protect_lua_call(state, 2, get_table_s)?;
    Ok(state.type_of(-1))
}

/// `t[k] = v` with key and value on top, honouring metamethods. Uses 3 stack spaces.
pub fn set_table(state: &mut State, table: c_int) -> Result<()> {
    state.push_value(table);
    state.rotate(-3, 1);
    protect_lua_call(state, 3, set_table_s)
}

/// Pushes `t[i]`. Uses 4 stack spaces.
pub fn geti(state: &mut State, table: c_int, i: Integer) -> Result<Type> {
    state.push_value(table);
    state.push_integer(i);
    protect_lua_call(state, 2, geti_s)?;
    Ok(state.type_of(-1))
}

/// Uses 3 stack spaces.
pub fn raw_set(state: &mut State, table: c_int) -> Result<()> {
    state.push_value(table);
    state.rotate(-3, 1);
    protect_lua_call(state, 3, raw_set_s)
}

/// Uses 4 stack spaces.
pub fn raw_set_i(state: &mut State, table: c_int, i: Integer) -> Result<()> {
    state.push_value(table);
    state.rotate(-2, 1);
    state.push_integer(i);
    protect_lua_call(state, 3, raw_seti_s)
}

/// Pops a value into `t[p]` with `p` as a light userdata key. Uses 4 stack spaces.
pub fn raw_set_p(state: &mut State, table: c_int, p: *const c_void) -> Result<()> {
    state.push_value(table);
    state.rotate(-2, 1);
    state.push_light_userdata(p as *mut c_void);
    protect_lua_call(state, 3, raw_setp_s)
}

/// Pops a value into `t[name]`. Uses 4 stack spaces.
pub fn raw_set_field(state: &mut State, table: c_int, name: &str) -> Result<()> {
    let arg = StringArg::new(name.as_bytes());
    state.push_value(table);
    state.rotate(-2, 1);
    push_string_arg(state, &arg);
    protect_lua_call(state, 3, raw_set_field_s)
}

/// Pops a value and inserts it at `t[i]`, shifting `t[i..]` up. Uses 4 stack spaces.
pub fn raw_insert(state: &mut State, table: c_int, i: Integer) -> Result<()> {
    state.push_value(table);
    state.rotate(-2, 1);
    state.push_integer(i);
    protect_lua_call(state, 3, raw_insert_s)
}

/// Removes `t[i]`, shifting `t[i+1..]` down and clearing the last slot.
/// Uses 4 stack spaces.
pub fn raw_remove(state: &mut State, table: c_int, i: Integer) -> Result<()> {
    state.push_value(table);
    state.push_integer(i);
    protect_lua_call(state, 2, raw_remove_s)
}

/// Length of the value at `idx`, honouring `__len`. Uses 3 stack spaces.
pub fn len(state: &mut State, idx: c_int) -> Result<Integer> {
    state.push_value(idx);
    protect_lua_call(state, 1, len_s)?;
    let n = state.to_integer(-1);
    state.pop(1);
    Ok(n)
}

/// Pops a key and pushes the next key and value of the table at `table`.
///
/// Returns `false`, having pushed nothing, when the traversal is over.
/// Uses 4 stack spaces.
pub fn next(state: &mut State, table: c_int) -> Result<bool> {
    let table = state.abs_index(table);
    state.push_value(table);
    state.rotate(-2, 1);
    protect_lua_call(state, 2, next_s)?;
    let ret = state.to_integer(-1);
    state.pop(1);
    Ok(ret != 0)
}
