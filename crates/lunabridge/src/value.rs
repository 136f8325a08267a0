//! Host-side values exchanged with the runtime
//!
//! `Value` is closed: every host value that can cross the boundary is one of
//! its variants, so there is no "unsupported kind" at marshal time. Numbers of
//! every width are folded into `f64` on conversion, matching the runtime's
//! single number representation at the boundary.

use std::fmt;
use std::rc::Rc;

use crate::error::{BridgeError, BridgeResult};
use crate::local::{LocalFunction, LocalRef};

/// Signature of a host callable invoked from scripts
pub type HostFn = dyn Fn(Vec<Value>) -> BridgeResult<Vec<Value>>;

/// A host callable that can be handed to the runtime.
///
/// Cloning shares the same callable.
#[derive(Clone)]
pub struct HostFunction(Rc<HostFn>);

impl HostFunction {
    /// Wrap a closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> BridgeResult<Vec<Value>> + 'static,
    {
        HostFunction(Rc::new(f))
    }

    /// Invoke the callable directly
    pub fn call(&self, args: Vec<Value>) -> BridgeResult<Vec<Value>> {
        (self.0)(args)
    }

    /// Whether both point at the same callable
    pub fn ptr_eq(&self, other: &HostFunction) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({:p})", Rc::as_ptr(&self.0) as *const ())
    }
}

/// A value on the host side of the boundary
#[derive(Debug)]
pub enum Value {
    /// Absent value
    Nil,
    /// Number (all numeric widths)
    Number(f64),
    /// Boolean
    Boolean(bool),
    /// UTF-8 string
    String(String),
    /// Runtime-owned non-primitive value
    Reference(LocalRef),
    /// Runtime-owned callable
    Function(LocalFunction),
    /// Host callable to be exposed to scripts
    HostFunction(HostFunction),
}

impl Value {
    /// Create a host callable value
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> BridgeResult<Vec<Value>> + 'static,
    {
        Value::HostFunction(HostFunction::new(f))
    }

    /// Name of the variant for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::Reference(r) => r.kind().name(),
            Value::Function(_) => "function",
            Value::HostFunction(_) => "host function",
        }
    }

    /// Check if value is nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Get number if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get boolean if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get string slice if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the underlying reference of a `Reference` or `Function`
    pub fn as_reference(&self) -> Option<&LocalRef> {
        match self {
            Value::Reference(r) => Some(r),
            Value::Function(f) => Some(f.as_reference()),
            _ => None,
        }
    }

    /// Get the callable if this is a runtime function
    pub fn as_function(&self) -> Option<&LocalFunction> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Extract a typed value
    pub fn into_typed<T: FromValue>(self) -> BridgeResult<T> {
        T::from_value(self)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a.same_cell(b),
            (Value::Function(a), Value::Function(b)) => {
                a.as_reference().same_cell(b.as_reference())
            }
            (Value::HostFunction(a), Value::HostFunction(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

// ============================================================================
// Host -> Value
// ============================================================================

macro_rules! impl_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

impl_from_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<LocalRef> for Value {
    fn from(r: LocalRef) -> Self {
        Value::Reference(r)
    }
}

impl From<LocalFunction> for Value {
    fn from(f: LocalFunction) -> Self {
        Value::Function(f)
    }
}

impl From<HostFunction> for Value {
    fn from(f: HostFunction) -> Self {
        Value::HostFunction(f)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

// ============================================================================
// Value -> Host
// ============================================================================

/// Typed extraction from a [`Value`]
pub trait FromValue: Sized {
    /// Convert, reporting `TypeMismatch` for the wrong variant
    fn from_value(value: Value) -> BridgeResult<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> BridgeError {
    BridgeError::TypeMismatch {
        expected,
        found: value.type_name(),
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> BridgeResult<Self> {
        Ok(value)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Number(n) => Ok(n),
            other => Err(mismatch("number", &other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Number(n) if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 => {
                Ok(n as i64)
            }
            Value::Number(n) => Err(BridgeError::UnsupportedType(format!(
                "number {} has no integer representation",
                n
            ))),
            other => Err(mismatch("number", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Boolean(b) => Ok(b),
            other => Err(mismatch("boolean", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl FromValue for LocalRef {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Reference(r) => Ok(r),
            Value::Function(f) => Ok(f.into_reference()),
            other => Err(mismatch("reference", &other)),
        }
    }
}

impl FromValue for LocalFunction {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Function(f) => Ok(f),
            other => Err(mismatch("function", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_fold_to_f64() {
        assert_eq!(Value::from(7u8), Value::Number(7.0));
        assert_eq!(Value::from(-3i64), Value::Number(-3.0));
        assert_eq!(Value::from(1.5f32), Value::Number(1.5));
        assert_eq!(Value::from(usize::MAX).as_number(), Some(usize::MAX as f64));
    }

    #[test]
    fn test_option_and_unit_are_nil() {
        assert!(Value::from(None::<bool>).is_nil());
        assert!(Value::from(()).is_nil());
        assert_eq!(Value::from(Some("x")), Value::String("x".into()));
    }

    #[test]
    fn test_typed_extraction() {
        assert_eq!(Value::Number(13.0).into_typed::<f64>().unwrap(), 13.0);
        assert_eq!(Value::Number(13.0).into_typed::<i64>().unwrap(), 13);
        assert_eq!(Value::from("test").into_typed::<String>().unwrap(), "test");
        assert_eq!(Value::Nil.into_typed::<Option<bool>>().unwrap(), None);
    }

    #[test]
    fn test_type_mismatch_names_both_sides() {
        let err = Value::Boolean(true).into_typed::<String>().unwrap_err();
        match err {
            BridgeError::TypeMismatch { expected, found } => {
                assert_eq!(expected, "string");
                assert_eq!(found, "boolean");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_fractional_number_is_not_an_integer() {
        let err = Value::Number(2.5).into_typed::<i64>().unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedType(_)));
    }

    #[test]
    fn test_host_function_identity() {
        let f = HostFunction::new(|args| Ok(args));
        let g = f.clone();
        let h = HostFunction::new(|_| Ok(vec![]));
        assert_eq!(Value::from(f.clone()), Value::from(g));
        assert_ne!(Value::from(f), Value::from(h));
    }

    #[test]
    fn test_host_function_direct_call() {
        let double = HostFunction::new(|args| {
            let n = args.into_iter().next().unwrap_or(Value::Nil).into_typed::<f64>()?;
            Ok(vec![Value::from(n * 2.0)])
        });
        let out = double.call(vec![Value::from(4)]).unwrap();
        assert_eq!(out, vec![Value::Number(8.0)]);
        assert!(double.call(vec![]).is_err());
    }
}
