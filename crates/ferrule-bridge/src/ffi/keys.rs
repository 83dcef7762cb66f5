//! Process-wide identity keys for wrapped payloads
//!
//! A key is the address of a private static. Registering a payload kind
//! records its size once; after that the key is published and every runtime
//! stores the kind's metatable in its registry under it. A payload is
//! identified by comparing its metatable with the registered one.

use std::ffi::c_void;
use std::sync::OnceLock;

static WRAPPED_ERROR_KEY: u8 = 0;
static WRAPPED_PANIC_KEY: u8 = 0;

static WRAPPED_ERROR_SIZE: OnceLock<usize> = OnceLock::new();
static WRAPPED_PANIC_SIZE: OnceLock<usize> = OnceLock::new();

/// Identity keys as seen by the classifier. A missing key means the kind was
/// never registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadKeys {
    pub error: Option<*const c_void>,
    pub panic: Option<*const c_void>,
}

impl PayloadKeys {
    /// Keys registered in this process.
    pub fn current() -> PayloadKeys {
        PayloadKeys {
            error: wrapped_error_key(),
            panic: wrapped_panic_key(),
        }
    }
}

/// Registers the recoverable error kind. Later calls keep the first size.
pub fn register_wrapped_error(size: usize) {
    let _ = WRAPPED_ERROR_SIZE.set(size);
}

/// Registers the host panic kind. Later calls keep the first size.
pub fn register_wrapped_panic(size: usize) {
    let _ = WRAPPED_PANIC_SIZE.set(size);
}

pub fn wrapped_error_key() -> Option<*const c_void> {
    WRAPPED_ERROR_SIZE
        .get()
        .map(|_| &WRAPPED_ERROR_KEY as *const u8 as *const c_void)
}

pub fn wrapped_panic_key() -> Option<*const c_void> {
    WRAPPED_PANIC_SIZE
        .get()
        .map(|_| &WRAPPED_PANIC_KEY as *const u8 as *const c_void)
}

pub fn wrapped_error_size() -> usize {
    WRAPPED_ERROR_SIZE.get().copied().unwrap_or(0)
}

pub fn wrapped_panic_size() -> usize {
    WRAPPED_PANIC_SIZE.get().copied().unwrap_or(0)
}

/// Size of a failure slot: large enough for either payload kind.
pub fn failure_slot_size() -> usize {
    wrapped_error_size().max(wrapped_panic_size())
}
