//! The POD encoding of a [`Value`] used inside every container's
//! shared-memory storage (dict entries, list/tuple vector slots).
//!
//! Kept separate from `Value` itself since `Value` is the ergonomic,
//! owned Rust-side type (it owns a `String`), while `ValueSlot` is the
//! fixed-size, `#[repr(C)]` encoding that actually has to sit in shared
//! memory.

use std::hash::{Hash, Hasher};

use crate::error::{ProcshareError, Result};
use crate::handle::Handle;
use crate::value::Value;

const TAG_NONE: u8 = 0;
const TAG_BOOL_FALSE: u8 = 1;
const TAG_BOOL_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_SHARED: u8 = 6;

const STR_INLINE_CAP: usize = 32;

#[derive(Copy, Clone)]
#[repr(C)]
pub struct ValueSlot {
    tag: u8,
    int: i64,
    float: f64,
    pub handle: Handle,
    str_len: u16,
    str_buf: [u8; STR_INLINE_CAP],
}

impl ValueSlot {
    pub const EMPTY: ValueSlot = ValueSlot {
        tag: TAG_NONE,
        int: 0,
        float: 0.0,
        handle: Handle::NULL,
        str_len: 0,
        str_buf: [0; STR_INLINE_CAP],
    };

    /// Encodes `v` into a fixed-size slot. Fails with `StringTooLong` if
    /// `v` is a string longer than the inline capacity; callers that need
    /// to store longer strings must heap-allocate the content themselves
    /// (as `Value::Shared` string objects do) rather than inlining it.
    pub fn from_value(v: &Value) -> Result<ValueSlot> {
        let mut slot = ValueSlot::EMPTY;
        match v {
            Value::None => slot.tag = TAG_NONE,
            Value::Bool(b) => slot.tag = if *b { TAG_BOOL_TRUE } else { TAG_BOOL_FALSE },
            Value::Int(i) => {
                slot.tag = TAG_INT;
                slot.int = *i;
            }
            Value::Float(f) => {
                slot.tag = TAG_FLOAT;
                slot.float = *f;
            }
            Value::Str(s) => {
                slot.tag = TAG_STR;
                let bytes = s.as_bytes();
                if bytes.len() > slot.str_buf.len() {
                    return Err(ProcshareError::StringTooLong);
                }
                slot.str_buf[..bytes.len()].copy_from_slice(bytes);
                slot.str_len = bytes.len() as u16;
            }
            Value::Shared(h) => {
                slot.tag = TAG_SHARED;
                slot.handle = *h;
            }
        }
        Ok(slot)
    }

    pub fn to_value(self) -> Value {
        match self.tag {
            TAG_NONE => Value::None,
            TAG_BOOL_FALSE => Value::Bool(false),
            TAG_BOOL_TRUE => Value::Bool(true),
            TAG_INT => Value::Int(self.int),
            TAG_FLOAT => Value::Float(self.float),
            TAG_STR => Value::Str(
                String::from_utf8_lossy(&self.str_buf[..self.str_len as usize]).into_owned(),
            ),
            TAG_SHARED => Value::Shared(self.handle),
            _ => Value::None,
        }
    }

    pub fn shallow_eq(&self, other: &ValueSlot) -> bool {
        self.to_value().shallow_eq(&other.to_value())
    }

    pub fn is_shared(&self) -> bool {
        self.tag == TAG_SHARED
    }
}

pub fn hash_value(v: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    match v {
        Value::None => 0u8.hash(&mut hasher),
        Value::Bool(b) => b.hash(&mut hasher),
        Value::Int(i) => i.hash(&mut hasher),
        Value::Float(f) => f.to_bits().hash(&mut hasher),
        Value::Str(s) => s.hash(&mut hasher),
        Value::Shared(h) => h.hash(&mut hasher),
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_variants() {
        for v in [
            Value::None,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Float(3.5),
            Value::Str("hi".to_string()),
            Value::Shared(Handle {
                region: 1,
                offset: 8,
            }),
        ] {
            let slot = ValueSlot::from_value(&v).unwrap();
            assert_eq!(slot.to_value(), v);
        }
    }

    #[test]
    fn test_from_value_rejects_oversize_string() {
        let v = Value::Str("x".repeat(STR_INLINE_CAP + 1));
        assert!(matches!(
            ValueSlot::from_value(&v),
            Err(ProcshareError::StringTooLong)
        ));
        let v = Value::Str("x".repeat(STR_INLINE_CAP));
        assert!(ValueSlot::from_value(&v).is_ok());
    }
}
