//! Dynamic value model
//!
//! Operations exchange values through this model: built-in scalars by
//! value, class instances and arrays by shared reference. Reference
//! identity (`Arc` pointer equality) is what the graph serializer
//! preserves across the wire: two fields holding the same `ObjRef`
//! decode into two fields holding the same `ObjRef` on the peer.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{DateTime, Decimal, Guid, TimeSpan};

/// One class instance: its concrete schema type id and its field values,
/// inherited fields first, in schema order.
#[derive(Debug)]
pub struct ObjectInstance {
    pub type_id: u16,
    pub fields: Vec<Value>,
}

impl ObjectInstance {
    /// A fresh instance with every field null.
    pub fn new(type_id: u16, field_count: usize) -> ObjectInstance {
        ObjectInstance {
            type_id,
            fields: vec![Value::Null; field_count],
        }
    }
}

/// Shared, mutable reference to a class instance.
pub type ObjRef = Arc<RwLock<ObjectInstance>>;

/// Shared, mutable reference to an array.
pub type ArrRef = Arc<RwLock<Vec<Value>>>;

/// A dynamically typed protocol value.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    DateTime(DateTime),
    TimeSpan(TimeSpan),
    Guid(Guid),
    Str(String),
    Object(ObjRef),
    Array(ArrRef),
}

impl Value {
    /// Wrap a new class instance.
    pub fn object(type_id: u16, fields: Vec<Value>) -> Value {
        Value::Object(Arc::new(RwLock::new(ObjectInstance { type_id, fields })))
    }

    /// Wrap a new array.
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    /// The heap address identifying this reference for graph tracking,
    /// or `None` for scalars and null.
    pub fn ref_addr(&self) -> Option<usize> {
        match self {
            Value::Object(obj) => Some(Arc::as_ptr(obj) as usize),
            Value::Array(arr) => Some(Arc::as_ptr(arr) as *const () as usize),
            _ => None,
        }
    }

    /// Whether two values are the same shared reference.
    pub fn same_ref(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrRef> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::U64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Guid> for Value {
    fn from(v: Guid) -> Value {
        Value::Guid(v)
    }
}

impl From<DateTime> for Value {
    fn from(v: DateTime) -> Value {
        Value::DateTime(v)
    }
}

impl From<TimeSpan> for Value {
    fn from(v: TimeSpan) -> Value {
        Value::TimeSpan(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Value {
        Value::Decimal(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_identity() {
        let node = Value::object(20, vec![Value::I32(7)]);
        let clone = node.clone();
        assert!(node.same_ref(&clone));
        assert_eq!(node.ref_addr(), clone.ref_addr());

        let other = Value::object(20, vec![Value::I32(7)]);
        assert!(!node.same_ref(&other));
        assert_ne!(node.ref_addr(), other.ref_addr());
    }

    #[test]
    fn test_scalars_have_no_ref_addr() {
        assert_eq!(Value::I32(1).ref_addr(), None);
        assert_eq!(Value::Null.ref_addr(), None);
        assert_eq!(Value::Str("s".into()).ref_addr(), None);
    }

    #[test]
    fn test_cycle_construction() {
        // a.next = b, b.next = a
        let a = Value::object(20, vec![Value::Null]);
        let b = Value::object(20, vec![a.clone()]);
        if let Value::Object(obj) = &a {
            obj.write().fields[0] = b.clone();
        }

        let a_next = a.as_object().unwrap().read().fields[0].clone();
        let b_next = a_next.as_object().unwrap().read().fields[0].clone();
        assert!(b_next.same_ref(&a));
    }
}
