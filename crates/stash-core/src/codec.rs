//! Key and record encoding.
//!
//! Keys are the concatenation of each key field's fixed-width encoding in
//! key order. Because every key field is static, two distinct keys of the
//! same table can never encode to the same bytes.
//!
//! Record data is every static value field back-to-back in schema order,
//! followed by each dynamic value field as a 4-byte big-endian length and
//! its payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::kind::Value;
use crate::operation::Fields;
use crate::table::{FieldSpec, TableDef};

/// Canonical encoded key: a record's identity within its table.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey(#[serde(with = "hex::serde")] Vec<u8>);

impl EncodedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

/// Encode the key fields of `key`. Fields that are not part of the key are ignored.
pub fn encode_key(table: &TableDef, key: &Fields) -> Result<EncodedKey, CodecError> {
    let mut out = Vec::with_capacity(table.key_width());
    for field in table.key_fields() {
        let value = key
            .get(&field.name)
            .ok_or_else(|| CodecError::MissingField(field.name.clone()))?;
        field.kind.encode(&field.name, value, &mut out)?;
    }
    Ok(EncodedKey(out))
}

pub fn decode_key(table: &TableDef, key: &[u8]) -> Result<Fields, CodecError> {
    let expected = table.key_width();
    if key.len() != expected {
        return Err(CodecError::WidthMismatch {
            expected,
            actual: key.len(),
        });
    }
    let mut fields = Fields::new();
    let mut offset = 0;
    for field in table.key_fields() {
        let width = field.kind.static_width().unwrap_or(0);
        let value = field.kind.decode(&field.name, &key[offset..offset + width])?;
        fields.insert(field.name.clone(), value);
        offset += width;
    }
    Ok(fields)
}

/// Copy just the key fields out of `fields`, checking they are all present.
pub fn extract_key(table: &TableDef, fields: &Fields) -> Result<Fields, CodecError> {
    table
        .key_fields()
        .map(|f| {
            fields
                .get(&f.name)
                .cloned()
                .map(|v| (f.name.clone(), v))
                .ok_or_else(|| CodecError::MissingField(f.name.clone()))
        })
        .collect()
}

/// Check a full value against the schema and return just its value fields.
///
/// Key fields present in `value` are ignored; unknown fields are rejected.
pub fn normalize_value(table: &TableDef, value: &Fields) -> Result<Fields, CodecError> {
    if let Some(unknown) = value.keys().find(|name| table.field(name).is_none()) {
        return Err(CodecError::UnknownField(unknown.clone()));
    }
    table
        .value_fields()
        .map(|f| {
            let v = value
                .get(&f.name)
                .ok_or_else(|| CodecError::MissingField(f.name.clone()))?;
            check_kind(f, v)?;
            Ok((f.name.clone(), v.clone()))
        })
        .collect()
}

/// Check a single value field write.
pub fn check_field(table: &TableDef, field: &str, value: &Value) -> Result<(), CodecError> {
    let spec = table
        .field(field)
        .ok_or_else(|| CodecError::UnknownField(field.to_string()))?;
    if table.is_key(field) {
        return Err(CodecError::KeyField {
            field: field.to_string(),
        });
    }
    check_kind(spec, value)
}

fn check_kind(spec: &FieldSpec, value: &Value) -> Result<(), CodecError> {
    if spec.kind.accepts(value) {
        Ok(())
    } else {
        Err(CodecError::KindMismatch {
            field: spec.name.clone(),
            kind: spec.kind.to_string(),
        })
    }
}

/// Every value field at its kind's default.
pub fn default_record(table: &TableDef) -> Fields {
    table
        .value_fields()
        .map(|f| (f.name.clone(), f.kind.default_value()))
        .collect()
}

pub fn encode_record(table: &TableDef, value: &Fields) -> Result<Vec<u8>, CodecError> {
    let mut static_part = Vec::new();
    let mut dynamic_part = Vec::new();
    for field in table.value_fields() {
        let v = value
            .get(&field.name)
            .ok_or_else(|| CodecError::MissingField(field.name.clone()))?;
        if field.kind.is_static() {
            field.kind.encode(&field.name, v, &mut static_part)?;
        } else {
            let mut payload = Vec::new();
            field.kind.encode(&field.name, v, &mut payload)?;
            dynamic_part.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            dynamic_part.extend_from_slice(&payload);
        }
    }
    static_part.extend_from_slice(&dynamic_part);
    Ok(static_part)
}

pub fn decode_record(table: &TableDef, data: &[u8]) -> Result<Fields, CodecError> {
    let mut fields = Fields::new();
    let mut offset = 0;

    for field in table.value_fields().filter(|f| f.kind.is_static()) {
        let width = field.kind.static_width().unwrap_or(0);
        let chunk = data
            .get(offset..offset + width)
            .ok_or_else(|| CodecError::Truncated(field.name.clone()))?;
        fields.insert(field.name.clone(), field.kind.decode(&field.name, chunk)?);
        offset += width;
    }

    for field in table.value_fields().filter(|f| !f.kind.is_static()) {
        let len_bytes = data
            .get(offset..offset + 4)
            .ok_or_else(|| CodecError::Truncated(field.name.clone()))?;
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        offset += 4;
        let chunk = data
            .get(offset..offset + len)
            .ok_or_else(|| CodecError::Truncated(field.name.clone()))?;
        fields.insert(field.name.clone(), field.kind.decode(&field.name, chunk)?);
        offset += len;
    }

    if offset != data.len() {
        return Err(CodecError::TrailingBytes(data.len() - offset));
    }
    Ok(fields)
}

/// Encode a single value field, unframed.
pub fn encode_field(table: &TableDef, field: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
    check_field(table, field, value)?;
    let spec = table
        .field(field)
        .ok_or_else(|| CodecError::UnknownField(field.to_string()))?;
    let mut out = Vec::new();
    spec.kind.encode(field, value, &mut out)?;
    Ok(out)
}

pub fn decode_field(table: &TableDef, field: &str, data: &[u8]) -> Result<Value, CodecError> {
    let spec = table
        .field(field)
        .ok_or_else(|| CodecError::UnknownField(field.to_string()))?;
    if table.is_key(field) {
        return Err(CodecError::KeyField {
            field: field.to_string(),
        });
    }
    spec.kind.decode(field, data)
}
