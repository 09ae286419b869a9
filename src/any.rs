use dyn_clone::DynClone;
use std::{
    any::{type_name, Any, TypeId},
    fmt::{self, Debug},
    hash::Hash,
};

use crate::core::errors::{FlowError, Result};

/// Conversion to [`Any`] to workaround [#65991](https://github.com/rust-lang/rust/issues/65991).
/// Implemented for anything that's `'static` and [`Clone`].
pub trait IntoAny: DynClone + Any + Send + Sync {
    /// The conversion.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
    fn as_any(&self) -> &dyn Any;
    /// Tag of the concrete type behind the erasure.
    fn value_type(&self) -> ValueType;
}

dyn_clone::clone_trait_object!(IntoAny);

impl<T: 'static + Clone + Send + Sync> IntoAny for T {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        Box::new(*self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn value_type(&self) -> ValueType {
        ValueType::of::<T>()
    }
}

impl Debug for dyn IntoAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Attempt to downcast to a concrete type that implements Debug
        let any = self.as_any();
        if let Some(v) = any.downcast_ref::<f64>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<f32>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<i64>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<i32>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<i16>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<u8>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<u32>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<u64>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<usize>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<bool>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<String>() {
            return write!(f, "{:?}", v);
        } else if let Some(v) = any.downcast_ref::<&str>() {
            return write!(f, "{:?}", v);
        }

        write!(f, "<{}>", self.value_type().short_name())
    }
}

/// A type-erased value travelling between ports.
pub type Value = Box<dyn IntoAny>;

/// Types that can flow through node ports.
pub trait FlowValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> FlowValue for T {}

/// Erases a value so it can be pushed through a port.
pub fn into_value<T: FlowValue>(value: T) -> Value {
    Box::new(value)
}

/// Tag of the concrete type inside an erased value.
pub fn value_type_of(value: &Value) -> ValueType {
    (**value).value_type()
}

pub fn downcast<T: 'static>(value: Value) -> std::result::Result<T, Value> {
    if !(*value).as_any().is::<T>() {
        return Err(value);
    }
    match value.into_any().downcast::<T>() {
        Ok(value) => Ok(*value),
        // The type id was checked above.
        Err(_) => unreachable!("type id checked before downcast"),
    }
}

/// Downcast that reports a [`FlowError::TypeMismatch`] naming `context`.
pub fn downcast_value<T: 'static>(value: Value, context: &str) -> Result<T> {
    downcast::<T>(value).map_err(|value| {
        FlowError::type_mismatch(type_name::<T>(), value_type_of(&value).name(), context)
    })
}

/// A [`TypeId`] and the type's name.
#[derive(Debug, Clone, Copy)]
pub struct ValueType {
    id: TypeId,
    name: &'static str,
}

impl ValueType {
    /// Gets the [`TypeId`].
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Gets the type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name with module paths stripped, `Vec<String>` rather than
    /// `alloc::vec::Vec<alloc::string::String>`.
    pub fn short_name(&self) -> String {
        short_type_name(self.name)
    }

    pub fn is_unit(&self) -> bool {
        self.id == TypeId::of::<()>()
    }

    /// Returns the [`ValueType`] of the type this generic function has been
    /// instantiated with.
    pub fn of<T: 'static>() -> Self {
        ValueType {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Fails with a type mismatch unless `actual` is this type.
    pub fn expect(&self, actual: ValueType, context: &str) -> Result<()> {
        if *self == actual {
            Ok(())
        } else {
            Err(FlowError::type_mismatch(self.name, actual.name, context))
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())
    }
}

impl Hash for ValueType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &ValueType) -> bool {
        self.id.eq(&other.id)
    }
}

impl Eq for ValueType {}

fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            segment.push(c);
        } else {
            out.push_str(segment.rsplit("::").next().unwrap_or(""));
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(segment.rsplit("::").next().unwrap_or(""));
    out
}
