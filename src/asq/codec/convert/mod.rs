//! Bidirectional conversion between the wire value space and
//! application native types.
//!
//! Wire types convert statically through [`Transferable`]; user
//! defined record types convert through [`TypeConversion`] extensions
//! registered process-wide during startup. The registry is frozen by
//! library init and immutable thereafter.

use std::any::Any;
use std::hash::{BuildHasher, Hash};
use std::result::Result as StdResult;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::asq::error::*;
use crate::asq::globals::Flag;
use crate::asq::protocol::value::{Tuple, Value};

/// A non-fatal refusal: this codec extension doesn't handle the
/// value, try the next one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Unsatisfied;

impl std::fmt::Display for Unsatisfied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no value conversion accepted the value")
    }
}

/// A per-record-type adapter between native values and wire tuples.
///
/// Extensions are registered with [`register`] during startup and
/// consulted in reverse registration order, latest first.
pub trait TypeConversion: Send + Sync {
    /// The schema name of the tuples this conversion understands.
    fn schema(&self) -> &str;

    /// Converts a native value into a named tuple, or refuses.
    fn to_tuple(&self, native: &dyn Any) -> StdResult<Tuple, Unsatisfied>;

    /// Reconstructs a native value out of a tuple, or refuses.
    fn from_tuple(&self, tuple: &Tuple) -> StdResult<Box<dyn Any + Send>, Unsatisfied>;
}

static EXTENSIONS: RwLock<Vec<Arc<dyn TypeConversion>>> = parking_lot::const_rwlock(Vec::new());
static FROZEN: Flag = Flag::new();

/// Registers a conversion extension.
///
/// Must run during startup: registration fails once the registry was
/// frozen by library init.
pub fn register(conversion: Arc<dyn TypeConversion>) -> Result<()> {
    if FROZEN.test() {
        return Err("The conversion registry is frozen after init")
            .wrapped(ErrorKind::CodecConvert);
    }
    EXTENSIONS.write().push(conversion);
    Ok(())
}

pub(crate) fn init() -> Result<()> {
    FROZEN.set();
    Ok(())
}

pub(crate) fn drop() -> Result<()> {
    FROZEN.unset();
    EXTENSIONS.write().clear();
    Ok(())
}

/// A snapshot of the registered conversion extensions.
///
/// Held by the dispatcher; walks extensions latest-first and
/// surfaces the first success.
#[derive(Clone)]
pub struct VariableCodec {
    extensions: Vec<Arc<dyn TypeConversion>>,
}

impl VariableCodec {
    /// Snapshots the process-wide registry.
    pub fn global() -> Self {
        Self {
            extensions: EXTENSIONS.read().clone(),
        }
    }

    /// Converts a native record into a wire tuple via the extensions.
    pub fn native_to_transferable(&self, native: &dyn Any) -> StdResult<Value, Unsatisfied> {
        for ext in self.extensions.iter().rev() {
            if let Ok(tuple) = ext.to_tuple(native) {
                let named = Tuple::with_schema(ext.schema(), tuple.into_fields());
                return Ok(Value::Tuple(named));
            }
        }
        Err(Unsatisfied)
    }

    /// Reconstructs a native record out of a wire tuple.
    ///
    /// A tuple designating a schema is routed to the extension
    /// registered under that name, so a peer may hand back a more
    /// specific record than the caller asked for; schema-less tuples
    /// are offered to every extension, latest first.
    pub fn transferable_to_native(
        &self,
        value: &Value,
    ) -> StdResult<Box<dyn Any + Send>, Unsatisfied> {
        let tuple = match value {
            Value::Tuple(tuple) => tuple,
            _ => return Err(Unsatisfied),
        };
        for ext in self.extensions.iter().rev() {
            if let Some(schema) = tuple.schema() {
                if schema != ext.schema() {
                    continue;
                }
            }
            if let Ok(native) = ext.from_tuple(tuple) {
                return Ok(native);
            }
        }
        Err(Unsatisfied)
    }

    /// Like `transferable_to_native`, downcast to a concrete type.
    pub fn transferable_to<T: Any>(&self, value: &Value) -> StdResult<T, Unsatisfied> {
        self.transferable_to_native(value)?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| Unsatisfied)
    }
}

/// Static conversion between a native type and the wire value space.
///
/// Implemented for every wire type directly, and recursively for
/// vectors and maps of transferable elements. Conversion from a
/// value follows C semantics on the numeric tower: two's complement
/// wrap on narrowing, IEEE-754 rounding into floats, `!= 0` into
/// booleans, canonical decimal form into strings, and the type's
/// zero out of null.
pub trait Transferable: Sized {
    fn into_transferable(self) -> Value;
    fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied>;
}

impl Transferable for Value {
    fn into_transferable(self) -> Value {
        self
    }

    fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
        Ok(value)
    }
}

impl Transferable for bool {
    fn into_transferable(self) -> Value {
        Value::Bool(self)
    }

    fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
        match value {
            Value::Null => Ok(false),
            Value::Bool(v) => Ok(v),
            Value::Int8(v) => Ok(v != 0),
            Value::Int16(v) => Ok(v != 0),
            Value::Int32(v) => Ok(v != 0),
            Value::Int64(v) => Ok(v != 0),
            Value::Float32(v) => Ok(v != 0.0 && v.is_finite()),
            Value::Float64(v) => Ok(v != 0.0 && v.is_finite()),
            _ => Err(Unsatisfied),
        }
    }
}

macro_rules! transferable_int {
    ($t:ty, $variant:ident) => {
        impl Transferable for $t {
            fn into_transferable(self) -> Value {
                Value::$variant(self)
            }

            fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
                match value {
                    Value::Null => Ok(0),
                    Value::Bool(v) => Ok(v as $t),
                    Value::Int8(v) => Ok(v as $t),
                    Value::Int16(v) => Ok(v as $t),
                    Value::Int32(v) => Ok(v as $t),
                    Value::Int64(v) => Ok(v as $t),
                    Value::Float32(v) => Ok(v as $t),
                    Value::Float64(v) => Ok(v as $t),
                    _ => Err(Unsatisfied),
                }
            }
        }
    };
}

transferable_int!(i8, Int8);
transferable_int!(i16, Int16);
transferable_int!(i32, Int32);
transferable_int!(i64, Int64);

macro_rules! transferable_float {
    ($t:ty, $variant:ident) => {
        impl Transferable for $t {
            fn into_transferable(self) -> Value {
                Value::$variant(self)
            }

            fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
                match value {
                    Value::Null => Ok(0.0),
                    Value::Bool(v) => Ok(if v { 1.0 } else { 0.0 }),
                    Value::Int8(v) => Ok(v as $t),
                    Value::Int16(v) => Ok(v as $t),
                    Value::Int32(v) => Ok(v as $t),
                    Value::Int64(v) => Ok(v as $t),
                    Value::Float32(v) => Ok(v as $t),
                    Value::Float64(v) => Ok(v as $t),
                    _ => Err(Unsatisfied),
                }
            }
        }
    };
}

transferable_float!(f32, Float32);
transferable_float!(f64, Float64);

impl Transferable for String {
    fn into_transferable(self) -> Value {
        Value::Text(self)
    }

    fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
        match value {
            Value::Text(v) => Ok(v),
            Value::Int8(v) => Ok(v.to_string()),
            Value::Int16(v) => Ok(v.to_string()),
            Value::Int32(v) => Ok(v.to_string()),
            Value::Int64(v) => Ok(v.to_string()),
            Value::Float32(v) => Ok(v.to_string()),
            Value::Float64(v) => Ok(v.to_string()),
            _ => Err(Unsatisfied),
        }
    }
}

impl Transferable for Vec<u8> {
    fn into_transferable(self) -> Value {
        Value::Binary(self)
    }

    fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
        match value {
            Value::Binary(v) => Ok(v),
            _ => Err(Unsatisfied),
        }
    }
}

impl Transferable for Uuid {
    fn into_transferable(self) -> Value {
        Value::Uuid(self)
    }

    fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
        match value {
            Value::Uuid(v) => Ok(v),
            _ => Err(Unsatisfied),
        }
    }
}

macro_rules! transferable_element {
    ($t:ty) => {
        impl Transferable for Vec<$t> {
            fn into_transferable(self) -> Value {
                Value::List(self.into_iter().map(Transferable::into_transferable).collect())
            }

            fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
                match value {
                    Value::List(items) => items
                        .into_iter()
                        .map(Transferable::from_transferable)
                        .collect(),
                    _ => Err(Unsatisfied),
                }
            }
        }
    };
}

// vectors of any transferable element become lists; `Vec<u8>` alone
// stays binary
transferable_element!(bool);
transferable_element!(i8);
transferable_element!(i16);
transferable_element!(i32);
transferable_element!(i64);
transferable_element!(f32);
transferable_element!(f64);
transferable_element!(String);
transferable_element!(Uuid);
transferable_element!(Value);
transferable_element!(Vec<u8>);

impl<K, V, S> Transferable for std::collections::HashMap<K, V, S>
where
    K: Transferable + Eq + Hash,
    V: Transferable,
    S: BuildHasher + Default,
{
    fn into_transferable(self) -> Value {
        Value::Map(
            self.into_iter()
                .map(|(k, v)| (k.into_transferable(), v.into_transferable()))
                .collect(),
        )
    }

    fn from_transferable(value: Value) -> StdResult<Self, Unsatisfied> {
        match value {
            Value::Map(pairs) => {
                let mut map = Self::with_capacity_and_hasher(pairs.len(), S::default());
                for (k, v) in pairs {
                    map.insert(K::from_transferable(k)?, V::from_transferable(v)?);
                }
                Ok(map)
            }
            _ => Err(Unsatisfied),
        }
    }
}
