//! Storage form of records.
//!
//! Plaintext fields are stored as plain JSON scalars. Each encrypted field is
//! stored in place as one JSON composite document:
//!
//! ```text
//! {"v":1,"i":{"t":"users","c":"email"},"c":"<base64 payload>","hm":"<hex>","bf":[3,17,...]}
//! ```
//!
//! `hm` (unique index) and `bf` (match index positions) are present only when
//! the column issued them, so a store can match on them without decrypting.

use crate::error::Error;
use crate::payload::{CiphertextPayload, PAYLOAD_VERSION};
use crate::record::{Field, Record};
use crate::terms::BloomFilter;
use crate::value::PlaintextValue;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Table and column an encrypted composite belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeIdent {
    /// Table name
    #[serde(rename = "t")]
    pub table: String,
    /// Column name
    #[serde(rename = "c")]
    pub column: String,
}

/// JSON composite holding one encrypted field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedComposite {
    /// Payload version
    #[serde(rename = "v")]
    pub version: u8,
    /// Owning table and column
    #[serde(rename = "i")]
    pub ident: CompositeIdent,
    /// Base64 of the binary payload
    #[serde(rename = "c")]
    pub ciphertext: String,
    /// Hex unique index
    #[serde(rename = "hm", default, skip_serializing_if = "Option::is_none")]
    pub unique_index: Option<String>,
    /// Match index positions
    #[serde(rename = "bf", default, skip_serializing_if = "Option::is_none")]
    pub match_index: Option<BloomFilter>,
}

impl EncryptedComposite {
    /// Builds the composite for a payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if the payload cannot be serialized.
    pub fn from_payload(payload: &CiphertextPayload) -> Result<Self, Error> {
        Ok(Self {
            version: payload.version(),
            ident: CompositeIdent {
                table: payload.table().to_string(),
                column: payload.column().to_string(),
            },
            ciphertext: STANDARD.encode(payload.to_bytes()?),
            unique_index: payload.unique_index().map(hex::encode),
            match_index: payload.match_index().cloned(),
        })
    }

    /// Rebuilds the payload, checking the composite is self-consistent.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedVersion` for unknown versions and
    /// `Error::IntegrityViolation` if the composite disagrees with the payload
    /// it carries. Integrity violations are logged.
    pub fn to_payload(&self) -> Result<CiphertextPayload, Error> {
        self.open().map_err(|e| match e {
            Error::IntegrityViolation(detail) => {
                Error::integrity_violation(&self.ident.table, &self.ident.column, detail)
            }
            other => other,
        })
    }

    fn open(&self) -> Result<CiphertextPayload, Error> {
        if self.version != PAYLOAD_VERSION {
            return Err(Error::UnsupportedVersion {
                version: self.version,
                supported: PAYLOAD_VERSION,
            });
        }
        let bytes = STANDARD.decode(&self.ciphertext).map_err(|e| {
            Error::IntegrityViolation(format!("composite ciphertext is not base64: {e}"))
        })?;
        let mut payload = CiphertextPayload::from_bytes(&bytes)?;

        if payload.table() != self.ident.table || payload.column() != self.ident.column {
            return Err(Error::IntegrityViolation(format!(
                "composite ident {}.{} does not match payload {}.{}",
                self.ident.table,
                self.ident.column,
                payload.table(),
                payload.column()
            )));
        }

        let flags = payload.flags();
        if flags.has_unique() != self.unique_index.is_some() {
            return Err(Error::IntegrityViolation(
                "unique index does not match payload flags".to_string(),
            ));
        }
        if flags.has_match() != self.match_index.is_some() {
            return Err(Error::IntegrityViolation(
                "match index does not match payload flags".to_string(),
            ));
        }

        if let Some(hm) = &self.unique_index {
            let index = hex::decode(hm)
                .map_err(|e| Error::IntegrityViolation(format!("unique index is not hex: {e}")))?;
            payload = payload.with_unique_index(index);
        }
        if let Some(bf) = &self.match_index {
            payload = payload.with_match_index(bf.clone());
        }
        Ok(payload)
    }

    /// Serializes to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if serialization fails.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::Encryption(format!("composite serialization failed: {e}")))
    }

    /// Parses a JSON string.
    ///
    /// # Errors
    ///
    /// Returns `Error::IntegrityViolation` if the document is not a composite.
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s)
            .map_err(|e| Error::IntegrityViolation(format!("malformed composite: {e}")))
    }
}

/// Value of one stored column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StorageValue {
    /// Encrypted composite document
    Encrypted(EncryptedComposite),
    /// Plain scalar
    Plain(PlaintextValue),
}

/// A record as it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRow {
    /// Record identifier
    pub id: i64,
    /// Stored columns
    pub columns: BTreeMap<String, StorageValue>,
}

impl StorageRow {
    /// Returns the encrypted composite of a column, if any.
    #[must_use]
    pub fn composite(&self, column: &str) -> Option<&EncryptedComposite> {
        match self.columns.get(column) {
            Some(StorageValue::Encrypted(composite)) => Some(composite),
            _ => None,
        }
    }
}

/// Converts a record to its storage form.
///
/// # Errors
///
/// Returns `Error::Encryption` if an encrypted field cannot be serialized.
pub fn to_storage_form(record: &Record) -> Result<StorageRow, Error> {
    let columns = record
        .fields()
        .map(|(column, field)| {
            let value = match field {
                Field::Plain(value) => StorageValue::Plain(value.clone()),
                Field::Encrypted(payload) => {
                    StorageValue::Encrypted(EncryptedComposite::from_payload(payload)?)
                }
            };
            Ok((column.to_string(), value))
        })
        .collect::<Result<_, Error>>()?;
    Ok(StorageRow { id: record.id(), columns })
}

/// Rebuilds a record from its storage form.
///
/// # Errors
///
/// Returns `Error::IntegrityViolation` if a composite is malformed or is
/// stored under a column other than the one it was sealed for.
pub fn from_storage_form(row: &StorageRow) -> Result<Record, Error> {
    let mut record = Record::new(row.id);
    for (column, value) in &row.columns {
        match value {
            StorageValue::Plain(value) => record.set_plain(column.as_str(), value.clone()),
            StorageValue::Encrypted(composite) => {
                if composite.ident.column != *column {
                    return Err(Error::integrity_violation(
                        &composite.ident.table,
                        column,
                        format!(
                            "composite for column {} stored under {column}",
                            composite.ident.column
                        ),
                    ));
                }
                record.set_encrypted(column.as_str(), composite.to_payload()?);
            }
        }
    }
    Ok(record)
}
