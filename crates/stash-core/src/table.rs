//! Table identity and schema definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::kind::PrimitiveKind;

const RESOURCE_TYPE_TABLE: &[u8; 2] = b"tb";
const NAMESPACE_BYTES: usize = 14;
const NAME_BYTES: usize = 16;

/// Stable identifier of a table: namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub namespace: String,
    pub name: String,
}

impl TableId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Check the namespace and name fit the 32-byte resource id layout.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.namespace.len() > NAMESPACE_BYTES {
            return Err(SchemaError::NamespaceTooLong(self.namespace.clone()));
        }
        if self.name.len() > NAME_BYTES {
            return Err(SchemaError::NameTooLong(self.name.clone()));
        }
        Ok(())
    }

    /// Canonical 32-byte resource id: `"tb"` ‖ namespace (14 bytes) ‖ name (16 bytes),
    /// each right-padded with zeros. Over-long parts are truncated; call
    /// [`validate`](Self::validate) first to reject them instead.
    pub fn resource_id(&self) -> [u8; 32] {
        let mut id = [0u8; 32];
        id[..2].copy_from_slice(RESOURCE_TYPE_TABLE);
        let ns = self.namespace.as_bytes();
        let ns_len = ns.len().min(NAMESPACE_BYTES);
        id[2..2 + ns_len].copy_from_slice(&ns[..ns_len]);
        let name = self.name.as_bytes();
        let name_len = name.len().min(NAME_BYTES);
        id[16..16 + name_len].copy_from_slice(&name[..name_len]);
        id
    }

    /// Resource id as `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.resource_id()))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// One schema column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: PrimitiveKind,
}

/// A table definition: id, ordered schema, and key fields.
///
/// Two definitions are structurally equal when their ids, field order,
/// field kinds and key order all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableDef {
    pub id: TableId,
    pub schema: Vec<FieldSpec>,
    pub key: Vec<String>,
}

impl TableDef {
    /// Build and validate a table definition.
    pub fn new(id: TableId, schema: Vec<FieldSpec>, key: Vec<String>) -> Result<Self, SchemaError> {
        let table = Self { id, schema, key };
        table.validate()?;
        Ok(table)
    }

    /// Build a table from ABI-style kind names, e.g. `("field2", "uint32")`.
    pub fn from_abi(
        namespace: &str,
        name: &str,
        schema: &[(&str, &str)],
        key: &[&str],
    ) -> Result<Self, SchemaError> {
        let schema = schema
            .iter()
            .map(|(field, kind)| {
                Ok(FieldSpec {
                    name: field.to_string(),
                    kind: kind.parse()?,
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;
        Self::new(
            TableId::new(namespace, name),
            schema,
            key.iter().map(|k| k.to_string()).collect(),
        )
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        self.id.validate()?;
        if self.schema.is_empty() {
            return Err(SchemaError::NoFields {
                table: self.id.clone(),
            });
        }
        for (i, field) in self.schema.iter().enumerate() {
            if self.schema[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField {
                    table: self.id.clone(),
                    field: field.name.clone(),
                });
            }
        }
        for (i, key) in self.key.iter().enumerate() {
            let field = self.field(key).ok_or_else(|| SchemaError::UnknownKeyField {
                table: self.id.clone(),
                field: key.clone(),
            })?;
            if !field.kind.is_static() {
                return Err(SchemaError::DynamicKeyField {
                    table: self.id.clone(),
                    field: key.clone(),
                    kind: field.kind.to_string(),
                });
            }
            if self.key[..i].contains(key) {
                return Err(SchemaError::DuplicateField {
                    table: self.id.clone(),
                    field: key.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.schema.iter().find(|f| f.name == name)
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.key.iter().any(|k| k == name)
    }

    /// Key fields, in key order.
    pub fn key_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.key.iter().filter_map(|k| self.field(k))
    }

    /// Non-key fields, in schema order.
    pub fn value_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.schema.iter().filter(|f| !self.is_key(&f.name))
    }

    /// Total encoded width of the key.
    pub fn key_width(&self) -> usize {
        self.key_fields()
            .filter_map(|f| f.kind.static_width())
            .sum()
    }
}
