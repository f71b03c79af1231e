//! Primitive field kinds and typed values.
//!
//! `PrimitiveKind` is a closed set. Each kind knows its static width (if
//! any), how to encode and decode a [`Value`] of that kind, and its default
//! value, so callers resolve the kind once and never branch on type names.

use std::fmt;
use std::str::FromStr;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, SchemaError};

/// Field kind of a table schema column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PrimitiveKind {
    Bool,
    /// Unsigned integer of the given bit width (8..=256, multiple of 8).
    Uint(u16),
    /// Signed integer of the given bit width (8..=128, multiple of 8).
    Int(u16),
    /// Fixed-size byte array (1..=32 bytes).
    FixedBytes(u8),
    /// 20-byte account address.
    Address,
    Bytes,
    String,
    /// Dynamic-length array of a static element kind.
    Array(Box<PrimitiveKind>),
}

impl PrimitiveKind {
    /// Encoded width in bytes, or `None` for dynamically-sized kinds.
    pub fn static_width(&self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Uint(bits) | Self::Int(bits) => Some(usize::from(*bits) / 8),
            Self::FixedBytes(len) => Some(usize::from(*len)),
            Self::Address => Some(20),
            Self::Bytes | Self::String | Self::Array(_) => None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.static_width().is_some()
    }

    /// Value a field of this kind takes when it has never been written.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Uint(_) => Value::Uint(U256::zero()),
            Self::Int(_) => Value::Int(0),
            Self::FixedBytes(len) => Value::FixedBytes(vec![0; usize::from(*len)]),
            Self::Address => Value::Address([0; 20]),
            Self::Bytes => Value::Bytes(Vec::new()),
            Self::String => Value::String(String::new()),
            Self::Array(_) => Value::Array(Vec::new()),
        }
    }

    /// Whether `value` is of this kind and fits its width.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Uint(bits), Value::Uint(v)) => v.bits() <= usize::from(*bits),
            (Self::Int(bits), Value::Int(v)) => {
                if *bits >= 128 {
                    return true;
                }
                let half = 1i128 << (bits - 1);
                (-half..half).contains(v)
            }
            (Self::FixedBytes(len), Value::FixedBytes(b)) => b.len() == usize::from(*len),
            (Self::Address, Value::Address(_)) => true,
            (Self::Bytes, Value::Bytes(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Array(elem), Value::Array(items)) => items.iter().all(|i| elem.accepts(i)),
            _ => false,
        }
    }

    /// Append the encoding of `value` to `out`.
    ///
    /// Static kinds write exactly [`static_width`](Self::static_width) bytes,
    /// big-endian for integers. Dynamic kinds write their raw payload with no
    /// length prefix; framing is the caller's job.
    pub fn encode(&self, field: &str, value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if !self.accepts(value) {
            return Err(CodecError::KindMismatch {
                field: field.to_string(),
                kind: self.to_string(),
            });
        }
        match (self, value) {
            (Self::Bool, Value::Bool(b)) => out.push(u8::from(*b)),
            (Self::Uint(bits), Value::Uint(v)) => {
                let width = usize::from(*bits) / 8;
                out.extend((0..width).rev().map(|i| v.byte(i)));
            }
            (Self::Int(bits), Value::Int(v)) => {
                let width = usize::from(*bits) / 8;
                out.extend_from_slice(&v.to_be_bytes()[16 - width..]);
            }
            (Self::FixedBytes(_), Value::FixedBytes(b)) | (Self::Bytes, Value::Bytes(b)) => {
                out.extend_from_slice(b);
            }
            (Self::Address, Value::Address(a)) => out.extend_from_slice(a),
            (Self::String, Value::String(s)) => out.extend_from_slice(s.as_bytes()),
            (Self::Array(elem), Value::Array(items)) => {
                for item in items {
                    elem.encode(field, item, out)?;
                }
            }
            _ => unreachable!("accepts() guarantees kind and value agree"),
        }
        Ok(())
    }

    /// Decode a value of this kind from exactly `bytes`.
    pub fn decode(&self, field: &str, bytes: &[u8]) -> Result<Value, CodecError> {
        if let Some(width) = self.static_width() {
            if bytes.len() != width {
                return Err(CodecError::WidthMismatch {
                    expected: width,
                    actual: bytes.len(),
                });
            }
        }
        let value = match self {
            Self::Bool => Value::Bool(bytes[0] != 0),
            Self::Uint(_) => Value::Uint(U256::from_big_endian(bytes)),
            Self::Int(_) => {
                let fill = if bytes[0] & 0x80 != 0 { 0xff } else { 0x00 };
                let mut buf = [fill; 16];
                buf[16 - bytes.len()..].copy_from_slice(bytes);
                Value::Int(i128::from_be_bytes(buf))
            }
            Self::FixedBytes(_) => Value::FixedBytes(bytes.to_vec()),
            Self::Address => {
                let mut addr = [0u8; 20];
                addr.copy_from_slice(bytes);
                Value::Address(addr)
            }
            Self::Bytes => Value::Bytes(bytes.to_vec()),
            Self::String => Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| CodecError::InvalidUtf8(field.to_string()))?,
            ),
            Self::Array(elem) => {
                // Element kinds are always static, see `FromStr`.
                let width = elem.static_width().unwrap_or(1);
                if bytes.len() % width != 0 {
                    return Err(CodecError::Truncated(field.to_string()));
                }
                let items = bytes
                    .chunks_exact(width)
                    .map(|chunk| elem.decode(field, chunk))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Array(items)
            }
        };
        Ok(value)
    }
}

fn parse_bits(digits: &str, max: u16) -> Option<u16> {
    let bits: u16 = digits.parse().ok()?;
    (bits > 0 && bits <= max && bits % 8 == 0).then_some(bits)
}

impl FromStr for PrimitiveKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidKind(s.to_string());

        if let Some(elem) = s.strip_suffix("[]") {
            let elem: PrimitiveKind = elem.parse().map_err(|_| invalid())?;
            if !elem.is_static() {
                return Err(invalid());
            }
            return Ok(Self::Array(Box::new(elem)));
        }

        match s {
            "bool" => Ok(Self::Bool),
            "address" => Ok(Self::Address),
            "bytes" => Ok(Self::Bytes),
            "string" => Ok(Self::String),
            _ => {
                if let Some(bits) = s.strip_prefix("uint") {
                    parse_bits(bits, 256).map(Self::Uint).ok_or_else(invalid)
                } else if let Some(bits) = s.strip_prefix("int") {
                    parse_bits(bits, 128).map(Self::Int).ok_or_else(invalid)
                } else if let Some(len) = s.strip_prefix("bytes") {
                    len.parse::<u8>()
                        .ok()
                        .filter(|n| (1..=32).contains(n))
                        .map(Self::FixedBytes)
                        .ok_or_else(invalid)
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

impl TryFrom<String> for PrimitiveKind {
    type Error = SchemaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PrimitiveKind> for String {
    fn from(kind: PrimitiveKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Uint(bits) => write!(f, "uint{bits}"),
            Self::Int(bits) => write!(f, "int{bits}"),
            Self::FixedBytes(len) => write!(f, "bytes{len}"),
            Self::Address => f.write_str("address"),
            Self::Bytes => f.write_str("bytes"),
            Self::String => f.write_str("string"),
            Self::Array(elem) => write!(f, "{elem}[]"),
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Uint(U256),
    Int(i128),
    FixedBytes(#[serde(with = "hex::serde")] Vec<u8>),
    Address(#[serde(with = "hex::serde")] [u8; 20]),
    Bytes(#[serde(with = "hex::serde")] Vec<u8>),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<U256> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a `u64`, if it is an unsigned integer that fits.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) if v.bits() <= 64 => Some(v.low_u64()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<U256> for Value {
    fn from(v: U256) -> Self {
        Value::Uint(v)
    }
}

macro_rules! uint_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Uint(U256::from(v))
            }
        })*
    };
}

macro_rules! int_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(i128::from(v))
            }
        })*
    };
}

uint_from!(u8, u16, u32, u64, u128);
int_from!(i8, i16, i32, i64, i128);
