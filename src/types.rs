//! # Scalar Types and Values
//!
//! The storage core carries two fixed-width scalar types:
//!
//! | Type | Width on disk | Encoding |
//! |------|---------------|----------|
//! | Int  | 4 bytes       | big-endian two's-complement i32 |
//! | Text | 4 + 128 bytes | big-endian u32 byte length, then UTF-8 padded/truncated to 128 bytes |
//!
//! Values are totally ordered within a type; comparing across types is a
//! schema error, not an ordering. Text payloads longer than
//! [`TEXT_MAX_LEN`] are truncated on a character boundary when serialized,
//! so a round-trip canonicalizes the value.

use eyre::{bail, ensure, Result};
use std::cmp::Ordering;
use std::fmt;

/// Maximum stored byte length of a Text value.
pub const TEXT_MAX_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int,
    Text,
}

impl DataType {
    /// On-disk width of a field of this type.
    pub fn size(&self) -> usize {
        match self {
            DataType::Int => 4,
            DataType::Text => 4 + TEXT_MAX_LEN,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Int => write!(f, "INT"),
            DataType::Text => write!(f, "TEXT"),
        }
    }
}

/// Comparison operator applied between two values of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEq,
    LessThan,
    LessThanOrEq,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i32),
    Text(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Text(_) => DataType::Text,
        }
    }

    /// Total order within one type. Cross-type comparison is undefined and
    /// rejected.
    pub fn cmp_same_type(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
            (a, b) => bail!("cannot compare {} with {}", a.data_type(), b.data_type()),
        }
    }

    pub fn compare(&self, op: Op, other: &Value) -> Result<bool> {
        let ord = self.cmp_same_type(other)?;
        Ok(match op {
            Op::Equals => ord == Ordering::Equal,
            Op::NotEquals => ord != Ordering::Equal,
            Op::GreaterThan => ord == Ordering::Greater,
            Op::GreaterThanOrEq => ord != Ordering::Less,
            Op::LessThan => ord == Ordering::Less,
            Op::LessThanOrEq => ord != Ordering::Greater,
        })
    }

    /// Writes the field's on-disk form into `out`, which must be exactly
    /// `data_type().size()` bytes.
    pub fn serialize_into(&self, out: &mut [u8]) -> Result<()> {
        ensure!(
            out.len() == self.data_type().size(),
            "field buffer is {} bytes, expected {}",
            out.len(),
            self.data_type().size()
        );
        match self {
            Value::Int(v) => out.copy_from_slice(&v.to_be_bytes()),
            Value::Text(s) => {
                let mut bytes = s.as_bytes();
                if bytes.len() > TEXT_MAX_LEN {
                    let mut end = TEXT_MAX_LEN;
                    while !s.is_char_boundary(end) {
                        end -= 1;
                    }
                    bytes = &bytes[..end];
                }
                out[..4].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
                out[4..4 + bytes.len()].copy_from_slice(bytes);
                out[4 + bytes.len()..].fill(0);
            }
        }
        Ok(())
    }

    /// Inverse of [`serialize_into`](Self::serialize_into).
    pub fn deserialize(data_type: DataType, data: &[u8]) -> Result<Value> {
        ensure!(
            data.len() == data_type.size(),
            "field buffer is {} bytes, expected {}",
            data.len(),
            data_type.size()
        );
        match data_type {
            DataType::Int => {
                let v = i32::from_be_bytes(data[..4].try_into().expect("4-byte slice"));
                Ok(Value::Int(v))
            }
            DataType::Text => {
                let len = u32::from_be_bytes(data[..4].try_into().expect("4-byte slice")) as usize;
                ensure!(len <= TEXT_MAX_LEN, "text length {} exceeds {}", len, TEXT_MAX_LEN);
                let s = std::str::from_utf8(&data[4..4 + len])
                    .map_err(|e| eyre::eyre!("invalid utf-8 in text field: {}", e))?;
                Ok(Value::Text(s.to_string()))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_serializes_big_endian() {
        let mut buf = [0u8; 4];
        Value::Int(0x0102_0304).serialize_into(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn negative_int_round_trips() {
        let mut buf = [0u8; 4];
        Value::Int(-12345).serialize_into(&mut buf).unwrap();
        let back = Value::deserialize(DataType::Int, &buf).unwrap();
        assert_eq!(back, Value::Int(-12345));
    }

    #[test]
    fn text_is_length_prefixed_and_padded() {
        let mut buf = [0xFFu8; 132];
        Value::Text("hi".into()).serialize_into(&mut buf).unwrap();
        assert_eq!(&buf[..4], &2u32.to_be_bytes());
        assert_eq!(&buf[4..6], b"hi");
        assert!(buf[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_text_truncates_to_128_bytes() {
        let long = "x".repeat(200);
        let mut buf = [0u8; 132];
        Value::Text(long).serialize_into(&mut buf).unwrap();
        let back = Value::deserialize(DataType::Text, &buf).unwrap();
        assert_eq!(back, Value::Text("x".repeat(128)));
    }

    #[test]
    fn compare_within_type() {
        let a = Value::Int(1);
        let b = Value::Int(2);
        assert!(a.compare(Op::LessThan, &b).unwrap());
        assert!(b.compare(Op::GreaterThanOrEq, &a).unwrap());
        assert!(a.compare(Op::Equals, &Value::Int(1)).unwrap());
        assert!(a.compare(Op::NotEquals, &b).unwrap());
    }

    #[test]
    fn cross_type_comparison_is_rejected() {
        let a = Value::Int(1);
        let b = Value::Text("1".into());
        assert!(a.compare(Op::Equals, &b).is_err());
    }

    #[test]
    fn text_ordering_is_lexicographic() {
        let a = Value::Text("apple".into());
        let b = Value::Text("banana".into());
        assert!(a.compare(Op::LessThan, &b).unwrap());
    }
}
