//! Row-column mutations and their canonical encoding.
//!
//! A [`Change`] is the plaintext of a replicated message: one register
//! write `(table, row, column, value)`. Changes are encoded as canonical
//! CBOR (RFC 8949) so that every device produces identical bytes for the
//! same mutation:
//! - Fixed-order 4-element array, no map keys
//! - Integers: smallest valid encoding
//! - Lengths: definite only
//!
//! **CRITICAL**: This encoding is FROZEN. Changing it invalidates every
//! ciphertext already replicated.

use ciborium::value::Value as Cbor;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Column name of the logical-delete register.
///
/// A row is deleted iff this register holds [`Value::Int`]`(1)` at the
/// latest timestamp. No tombstone is emitted and history is preserved.
pub const IS_DELETED_COLUMN: &str = "isDeleted";

/// A typed scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque binary blob.
    Bytes(Vec<u8>),
}

impl Value {
    /// Encode this value alone as canonical CBOR.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.to_cbor(), &mut buf).expect("CBOR encoding to Vec cannot fail");
        buf
    }

    /// Decode a value encoded with [`Value::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Cbor = ciborium::from_reader(bytes)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        Self::from_cbor(&value)
    }

    fn to_cbor(&self) -> Cbor {
        match self {
            Value::Null => Cbor::Null,
            Value::Int(i) => Cbor::Integer((*i).into()),
            Value::Real(f) => Cbor::Float(*f),
            Value::Text(s) => Cbor::Text(s.clone()),
            Value::Bytes(b) => Cbor::Bytes(b.clone()),
        }
    }

    fn from_cbor(v: &Cbor) -> Result<Self> {
        match v {
            Cbor::Null => Ok(Value::Null),
            Cbor::Integer(i) => {
                let i: i64 = (*i)
                    .try_into()
                    .map_err(|_| CoreError::Serialization("integer out of i64 range".into()))?;
                Ok(Value::Int(i))
            }
            Cbor::Float(f) => Ok(Value::Real(*f)),
            Cbor::Text(s) => Ok(Value::Text(s.clone())),
            Cbor::Bytes(b) => Ok(Value::Bytes(b.clone())),
            other => Err(CoreError::Serialization(format!(
                "unexpected CBOR value: {other:?}"
            ))),
        }
    }
}

/// A single row-column mutation.
///
/// `(row, column)` identifies the register; the register's current value
/// is the one written at the greatest timestamp (last writer wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Table name.
    pub table: String,
    /// Row identifier (application-chosen, opaque to the engine).
    pub row: String,
    /// Column name.
    pub column: String,
    /// The written value.
    pub value: Value,
}

impl Change {
    /// Create a change.
    pub fn new(
        table: impl Into<String>,
        row: impl Into<String>,
        column: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            table: table.into(),
            row: row.into(),
            column: column.into(),
            value,
        }
    }

    /// The logical-delete marker for a row.
    pub fn delete_marker(table: impl Into<String>, row: impl Into<String>) -> Self {
        Self::new(table, row, IS_DELETED_COLUMN, Value::Int(1))
    }

    /// Whether this change marks its row as deleted.
    pub fn is_delete_marker(&self) -> bool {
        self.column == IS_DELETED_COLUMN && self.value == Value::Int(1)
    }

    /// Encode to canonical CBOR bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let value = Cbor::Array(vec![
            Cbor::Text(self.table.clone()),
            Cbor::Text(self.row.clone()),
            Cbor::Text(self.column.clone()),
            self.value.to_cbor(),
        ]);
        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).expect("CBOR encoding to Vec cannot fail");
        buf
    }

    /// Decode from canonical CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value: Cbor = ciborium::from_reader(bytes)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let Cbor::Array(items) = value else {
            return Err(CoreError::Serialization("expected CBOR array".into()));
        };
        let [table, row, column, cell]: [Cbor; 4] = items
            .try_into()
            .map_err(|_| CoreError::Serialization("expected 4-element array".into()))?;
        let text = |v: Cbor, field: &str| -> Result<String> {
            match v {
                Cbor::Text(s) => Ok(s),
                _ => Err(CoreError::Serialization(format!("{field} must be text"))),
            }
        };
        Ok(Self {
            table: text(table, "table")?,
            row: text(row, "row")?,
            column: text(column, "column")?,
            value: Value::from_cbor(&cell)?,
        })
    }
}
