//! Conversions from runtime values to host types

use crate::error::{Error, Result};
use ferrule_vm::{Integer, Number, Value};

/// A host type that can be read out of a runtime value.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value.to_boolean())
    }
}

impl FromValue for Integer {
    fn from_value(value: Value) -> Result<Self> {
        value.as_integer().ok_or_else(|| Error::FromValueConversion {
            from: value.type_name(),
            to: std::any::type_name::<Integer>(),
            message: matches!(value, Value::Number(_))
                .then(|| "number has no integer representation".to_string()),
        })
    }
}

impl FromValue for Number {
    fn from_value(value: Value) -> Result<Self> {
        value.as_number().ok_or(Error::FromValueConversion {
            from: value.type_name(),
            to: std::any::type_name::<Number>(),
            message: None,
        })
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::String(s) => s.to_str().map(str::to_owned).ok_or_else(|| {
                Error::FromValueConversion {
                    from: "string",
                    to: "String",
                    message: Some("invalid utf-8".to_string()),
                }
            }),
            Value::Integer(i) => Ok(i.to_string()),
            Value::Number(n) => Ok(ferrule_vm::value::format_number(*n)),
            _ => Err(Error::FromValueConversion {
                from: value.type_name(),
                to: "String",
                message: None,
            }),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Nil => Ok(None),
            value => T::from_value(value).map(Some),
        }
    }
}

/// Converts the argument at `pos` (0-based), treating a missing one as nil.
pub fn arg<T: FromValue>(args: &[Value], pos: usize) -> Result<T> {
    T::from_value(args.get(pos).cloned().unwrap_or_default())
}
