//! Ferrule Bridge
//!
//! Lets Rust closures be called from the ferrule runtime and runtime
//! functions be called from Rust, without ever unwinding a Rust panic or a
//! Rust error through foreign frames.
//!
//! - A host function returns its results, or reports failure through a
//!   pre-allocated failure slot that the trampoline raises as a foreign error
//! - Every protected call installs a classifier as message handler: host
//!   errors gain a traceback, host panics pass through untouched and are
//!   resumed once they are back in host code
//! - Stack primitives that may raise run inside protected calls and return
//!   [`Result`]
//!
//! # Example
//!
//! ```
//! use ferrule_bridge::{Bridge, Value};
//!
//! let mut bridge = Bridge::new().unwrap();
//! let add = bridge
//!     .create_function(|_, args| {
//!         let a: i64 = ferrule_bridge::arg(&args, 0)?;
//!         let b: i64 = ferrule_bridge::arg(&args, 1)?;
//!         Ok(vec![Value::Integer(a + b)])
//!     })
//!     .unwrap();
//!
//! let results = bridge
//!     .call_function(&add, vec![Value::Integer(2), Value::Integer(3)])
//!     .unwrap();
//! assert_eq!(results, vec![Value::Integer(5)]);
//! ```

pub mod bridge;
pub mod conversion;
pub mod error;
pub mod ffi;
pub mod hook;
pub mod userdata;
mod util;

pub use bridge::Bridge;
pub use conversion::{arg, FromValue};
pub use error::{Error, ExternalError, ExternalResult, Result};
pub use hook::HookTriggers;
pub use userdata::{borrow_userdata, borrow_userdata_mut, UserData, UserDataRegistry};

pub use ferrule_config::BridgeConfig;
pub use ferrule_vm::{Debug, HookEvent, Integer, Number, State, Status, Type, Value};
