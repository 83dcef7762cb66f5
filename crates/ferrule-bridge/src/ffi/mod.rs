//! Boundary between host code and the foreign runtime
//!
//! - [`safe`]: protected stack primitives returning `Result`
//! - [`shim`]: native entry points (trampolines, classifier, dispatch)
//! - [`keys`]: process-wide identity keys of wrapped payloads
//! - [`consts`]: runtime constants exported to the binding layer
//!
//! # Failure protocol
//!
//! A host function called by the runtime never lets an unwind escape into
//! foreign frames. It returns a result count, or [`FAILURE_SENTINEL`] after
//! writing its error into the failure slot reserved for it, and the
//! trampoline raises that slot as a foreign error.

pub mod consts;
pub mod keys;
pub mod safe;
pub mod shim;

use std::os::raw::c_int;

/// Returned by a host callback whose failure slot holds an error payload.
pub const FAILURE_SENTINEL: c_int = -1;

pub use keys::PayloadKeys;
pub use shim::{
    bind_call_impl, call_hook_proc, call_host, error_traceback, meta_index_impl,
    meta_newindex_impl, Headroom,
};
