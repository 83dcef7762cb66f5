//! Ferrule VM
//!
//! A small stack-based runtime with the shape of a classic embeddable
//! scripting engine C API:
//! - a value stack addressed by relative, negative and pseudo indices
//! - tables, native closures with upvalues, userdata with metatables
//! - a registry and a globals table
//! - protected calls with message handlers and non-local error raising
//! - call/return hooks, tracebacks and a memory limit
//!
//! All functions are native: there is no parser or bytecode. The runtime is
//! the foreign side that `ferrule-bridge` adapts host closures to.
//!
//! # Example
//!
//! ```
//! use ferrule_vm::{State, Status};
//! use std::os::raw::c_int;
//!
//! fn double(state: &mut State) -> c_int {
//!     let n = state.to_integer(1);
//!     state.push_integer(n * 2);
//!     1
//! }
//!
//! let mut state = State::new();
//! state.push_function(double);
//! state.push_integer(21);
//! assert_eq!(state.pcall(1, 1, 0), Status::Ok);
//! assert_eq!(state.to_integer(-1), 42);
//! ```

mod access;
pub mod base;
pub mod call;
pub mod config;
pub mod debug;
mod memory;
pub mod state;
pub mod table;
pub mod value;

pub use base::open_base;
pub use call::{Status, Throw};
pub use config::{
    upvalue_index, Limits, DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STACK, MAX_UPVALUES, MIN_STACK,
    MULTRET, REGISTRY_INDEX, RIDX_GLOBALS,
};
pub use debug::{Debug, HookEvent, HookFn, HookMask};
pub use state::State;
pub use table::{InvalidNextKey, Table};
pub use value::{
    FunctionRef, Integer, KeyError, NativeFn, Number, StringRef, TableRef, Type, UserDataAccess,
    UserDataRef, Value,
};
