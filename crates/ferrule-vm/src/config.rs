//! Runtime limits and fixed constants

use crate::value::Integer;
use std::os::raw::c_int;

/// Free slots guaranteed to every native function when it starts.
pub const MIN_STACK: usize = 20;

/// Upper bound for the stack size of a state.
pub const DEFAULT_MAX_STACK: usize = 1_000_000;

/// Nested native calls allowed before "stack overflow".
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Slots a message handler may use past `max_stack`.
pub const ERROR_STACK_RESERVE: usize = 200;

/// Extra call depth a message handler may use past `max_call_depth`.
pub const ERROR_CALL_RESERVE: usize = 10;

/// Upvalues a closure can capture.
pub const MAX_UPVALUES: usize = 255;

/// Longest `__index` / `__newindex` chain followed before giving up.
pub const MAX_META_CHAIN: usize = 100;

/// Option for multiple returns in `call` and `pcall`.
pub const MULTRET: c_int = -1;

/// Pseudo-index of the registry table.
pub const REGISTRY_INDEX: c_int = -(DEFAULT_MAX_STACK as c_int) - 1000;

/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: Integer = 2;

/// Pseudo-index of the `n`th upvalue (1-based) of the running closure.
pub const fn upvalue_index(n: c_int) -> c_int {
    REGISTRY_INDEX - n
}

/// Frames shown at each end of a long traceback.
pub(crate) const TRACEBACK_HEAD: usize = 10;
pub(crate) const TRACEBACK_TAIL: usize = 11;

/// Per-state limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of stack slots (capped at [`DEFAULT_MAX_STACK`])
    pub max_stack: usize,
    /// Maximum depth of nested native calls
    pub max_call_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_stack: DEFAULT_MAX_STACK,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}
