//! The closed set of values transferable inside `Open` parameters and
//! `Close` results.

use uuid::Uuid;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A member of the closed tagged sum transportable on the wire.
///
/// Lists and maps hold `Value` children directly. Maps preserve the
/// insertion order of their pairs; the wire format imposes none, and
/// float keys rule out a hashed representation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Binary(Vec<u8>),
    Text(String),
    Uuid(Uuid),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Tuple(Tuple),
}

/// A user-defined record: an ordered field vector with an optional
/// schema name.
///
/// Only the fields travel on the wire. The schema name is local
/// metadata attached by value conversions so that receivers can
/// reconstruct a specific record type; unknown schemas keep the raw
/// field vector.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Tuple {
    schema: Option<String>,
    fields: Vec<Value>,
}

impl Tuple {
    /// Maximum number of fields in a tuple.
    pub const MAX_ARITY: usize = 255;

    /// Creates a new schema-less tuple.
    pub fn new(fields: Vec<Value>) -> Self {
        Self {
            schema: None,
            fields,
        }
    }

    /// Creates a new tuple designating the record type `schema`.
    pub fn with_schema<S: Into<String>>(schema: S, fields: Vec<Value>) -> Self {
        Self {
            schema: Some(schema.into()),
            fields,
        }
    }

    /// Returns the schema name designated by this tuple, if any.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Returns the number of fields.
    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Returns a reference to the field vector.
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    /// Returns the inner field vector.
    pub fn into_fields(self) -> Vec<Value> {
        self.fields
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        // the schema is local metadata; two tuples decoded from the
        // same frame compare equal regardless of who attached a name
        self.fields == other.fields
    }
}

impl Value {
    /// A human readable name for the tag of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
            Value::Int8(_) => "int8",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Binary(_) => "binary",
            Value::Text(_) => "string",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Tuple(_) => "tuple",
        }
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    #[inline]
    fn from(v: i8) -> Value {
        Value::Int8(v)
    }
}

impl From<i16> for Value {
    #[inline]
    fn from(v: i16) -> Value {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(v: i32) -> Value {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(v: i64) -> Value {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    #[inline]
    fn from(v: f32) -> Value {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(v: f64) -> Value {
        Value::Float64(v)
    }
}

impl From<Vec<u8>> for Value {
    #[inline]
    fn from(v: Vec<u8>) -> Value {
        Value::Binary(v)
    }
}

impl From<String> for Value {
    #[inline]
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(v: &str) -> Value {
        Value::Text(v.into())
    }
}

impl From<Uuid> for Value {
    #[inline]
    fn from(v: Uuid) -> Value {
        Value::Uuid(v)
    }
}

impl From<Vec<Value>> for Value {
    #[inline]
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}

impl From<Tuple> for Value {
    #[inline]
    fn from(v: Tuple) -> Value {
        Value::Tuple(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_equality_ignores_schema() {
        let bare = Tuple::new(vec![Value::Int32(1), Value::Text("x".into())]);
        let named = Tuple::with_schema("point", vec![Value::Int32(1), Value::Text("x".into())]);
        assert_eq!(bare, named);
        assert_eq!(named.schema(), Some("point"));
        assert_eq!(bare.arity(), 2);
    }

    #[test]
    fn from_impls_tag_correctly() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(-1i8), Value::Int8(-1));
        assert_eq!(Value::from("hi"), Value::Text("hi".into()));
        assert_eq!(Value::from(vec![1u8, 2]), Value::Binary(vec![1, 2]));
    }
}
