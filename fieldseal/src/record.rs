//! Records: an identifier plus named fields, each plaintext or encrypted.

use crate::error::Error;
use crate::payload::CiphertextPayload;
use crate::policy::TablePolicy;
use crate::value::PlaintextValue;
use std::collections::BTreeMap;

/// One column of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Plaintext value
    Plain(PlaintextValue),
    /// Encrypted value
    Encrypted(CiphertextPayload),
}

impl Field {
    /// Returns `true` if the field is encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

/// A row keyed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: i64,
    fields: BTreeMap<String, Field>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self { id, fields: BTreeMap::new() }
    }

    /// Adds a plaintext field.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<PlaintextValue>) -> Self {
        self.set_plain(column, value);
        self
    }

    /// Sets a plaintext field, replacing any previous value.
    pub fn set_plain(&mut self, column: impl Into<String>, value: impl Into<PlaintextValue>) {
        self.fields.insert(column.into(), Field::Plain(value.into()));
    }

    /// Sets an encrypted field, replacing any previous value.
    pub fn set_encrypted(&mut self, column: impl Into<String>, payload: CiphertextPayload) {
        self.fields.insert(column.into(), Field::Encrypted(payload));
    }

    /// Sets a field.
    pub fn set(&mut self, column: impl Into<String>, field: Field) {
        self.fields.insert(column.into(), field);
    }

    /// Returns the record identifier.
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// Returns a field.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Field> {
        self.fields.get(column)
    }

    /// Returns a field's plaintext value, if present and not encrypted.
    #[must_use]
    pub fn plain(&self, column: &str) -> Option<&PlaintextValue> {
        match self.fields.get(column) {
            Some(Field::Plain(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns a field's payload, if present and encrypted.
    #[must_use]
    pub fn payload(&self, column: &str) -> Option<&CiphertextPayload> {
        match self.fields.get(column) {
            Some(Field::Encrypted(payload)) => Some(payload),
            _ => None,
        }
    }

    /// Removes a field and returns its plaintext value.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` if the field is still encrypted.
    pub fn take_plain(&mut self, column: &str) -> Result<Option<PlaintextValue>, Error> {
        match self.fields.remove(column) {
            None => Ok(None),
            Some(Field::Plain(value)) => Ok(Some(value)),
            Some(Field::Encrypted(_)) => {
                Err(Error::InvalidRecord(format!("column {column} is still encrypted")))
            }
        }
    }

    /// Iterates fields in column order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns `true` if every declared column present in the record is encrypted.
    #[must_use]
    pub fn is_encryption_complete(&self, policy: &TablePolicy) -> bool {
        self.fields
            .iter()
            .all(|(column, field)| !policy.is_encrypted(column) || field.is_encrypted())
    }
}

/// A type that maps to and from a [`Record`] of one table.
///
/// Usually implemented with `#[derive(Model)]` from `fieldseal-derive`.
pub trait Model: Sized {
    /// Table the model is stored in.
    const TABLE: &'static str;

    /// Converts the model into a plaintext record.
    fn into_record(self) -> Record;

    /// Rebuilds the model from a decrypted record.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` if a field is missing, has the wrong
    /// type, or is still encrypted.
    fn from_record(record: Record) -> Result<Self, Error>;
}
