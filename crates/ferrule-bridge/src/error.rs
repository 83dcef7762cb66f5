//! Host-side error type
//!
//! Every fallible bridge operation returns [`Result`]. Foreign errors that
//! reach the host are classified by the status of the protected call that
//! caught them; host errors raised through a callback come back as
//! [`Error::CallbackError`] carrying the original error as its cause.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error raised by the bridge or carried through the foreign runtime.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A foreign runtime error, stringified
    #[error("runtime error: {0}")]
    RuntimeError(String),

    /// The runtime ran out of memory
    #[error("memory error: {0}")]
    MemoryError(String),

    /// The message handler itself raised an error
    #[error("error in error handling: {0}")]
    ErrorInErrorHandling(String),

    /// Not enough free stack slots for an operation
    #[error("out of stack, too many arguments to a function or too many return values from a callback")]
    StackError,

    /// Too many bound arguments for the upvalue limit
    #[error("too many arguments to Function::bind")]
    BindError,

    /// A host callback failed; `traceback` is the foreign stack at the failure
    #[error("callback error\n{}\ncaused by: {cause}", .traceback.trim_end())]
    CallbackError {
        traceback: String,
        cause: Arc<Error>,
    },

    #[error("userdata is not expected type")]
    UserDataTypeMismatch,

    #[error("userdata already mutably borrowed")]
    UserDataBorrowError,

    #[error("userdata already borrowed")]
    UserDataBorrowMutError,

    /// A foreign value could not be converted to the requested host type
    #[error("error converting {from} to {to}{}", .message.as_ref().map(|m| format!(" ({})", m)).unwrap_or_default())]
    FromValueConversion {
        from: &'static str,
        to: &'static str,
        message: Option<String>,
    },

    /// The bridge configuration failed validation
    #[error("invalid bridge configuration: {0}")]
    ConfigError(Arc<ferrule_config::ConfigError>),

    /// A host panic was popped after it had already been resumed once
    #[error("previously resumed panic returned again")]
    PreviouslyResumedPanic,

    /// Any other host error
    #[error("{0}")]
    ExternalError(Arc<dyn StdError + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps any host error.
    pub fn external<T: Into<Box<dyn StdError + Send + Sync>>>(err: T) -> Error {
        let boxed: Box<dyn StdError + Send + Sync> = err.into();
        Error::ExternalError(Arc::from(boxed))
    }

    /// Shortcut for a runtime error with a message.
    pub fn runtime(msg: impl fmt::Display) -> Error {
        Error::RuntimeError(msg.to_string())
    }

    /// Innermost cause, following callback error chains.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::CallbackError { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Downcasts a wrapped host error.
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        match self.root_cause() {
            Error::ExternalError(err) => err.downcast_ref(),
            _ => None,
        }
    }
}

impl From<ferrule_config::ConfigError> for Error {
    fn from(err: ferrule_config::ConfigError) -> Self {
        Error::ConfigError(Arc::new(err))
    }
}

pub trait ExternalError {
    fn into_foreign_err(self) -> Error;
}

impl<E: Into<Box<dyn StdError + Send + Sync>>> ExternalError for E {
    fn into_foreign_err(self) -> Error {
        Error::external(self)
    }
}

pub trait ExternalResult<T> {
    fn into_foreign_err(self) -> Result<T>;
}

impl<T, E: ExternalError> ExternalResult<T> for std::result::Result<T, E> {
    fn into_foreign_err(self) -> Result<T> {
        self.map_err(|e| e.into_foreign_err())
    }
}
