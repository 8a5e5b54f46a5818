//! Ciphertext payload format.
//!
//! A payload carries everything needed to decrypt one field without an
//! external lookup:
//! - Format version
//! - Table and column the value was sealed for
//! - Key identifier reported by the provider
//! - Flags recording which search indexes were issued
//! - Provider-sealed bytes
//!
//! The search indexes themselves travel next to the binary form (see
//! [`storage`](crate::storage)) so that a store can match on them.

use crate::context::EncryptionContext;
use crate::error::Error;
use crate::terms::BloomFilter;

/// Payload format version.
pub const PAYLOAD_VERSION: u8 = 1;

/// Flags recording which indexes accompany a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadFlags(u8);

impl PayloadFlags {
    const UNIQUE: u8 = 0x01;
    const MATCH: u8 = 0x02;

    /// Creates empty flags.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Checks if a unique (equality) index was issued.
    #[must_use]
    pub const fn has_unique(self) -> bool {
        (self.0 & Self::UNIQUE) != 0
    }

    /// Checks if a match (free-text) index was issued.
    #[must_use]
    pub const fn has_match(self) -> bool {
        (self.0 & Self::MATCH) != 0
    }

    /// Sets the unique index flag.
    #[must_use]
    pub const fn with_unique(mut self) -> Self {
        self.0 |= Self::UNIQUE;
        self
    }

    /// Sets the match index flag.
    #[must_use]
    pub const fn with_match(mut self) -> Self {
        self.0 |= Self::MATCH;
        self
    }

    /// Returns the raw flags value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Creates flags from a raw value.
    ///
    /// # Errors
    ///
    /// Returns `Error::IntegrityViolation` if unknown bits are set.
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        if value & !(Self::UNIQUE | Self::MATCH) != 0 {
            return Err(Error::IntegrityViolation(format!("unknown payload flags: {value:#04x}")));
        }
        Ok(Self(value))
    }
}

/// Encrypted value of one field plus its search indexes.
///
/// Binary format:
/// ```text
/// [version:1][flags:1][table_len:1][table:N][column_len:1][column:M][key_id_len:1][key_id:K][sealed:rest]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextPayload {
    version: u8,
    table: String,
    column: String,
    key_id: String,
    flags: PayloadFlags,
    sealed: Vec<u8>,
    unique_index: Option<Vec<u8>>,
    match_index: Option<BloomFilter>,
}

impl CiphertextPayload {
    /// Creates a payload for sealed data with no indexes.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        key_id: impl Into<String>,
        sealed: Vec<u8>,
    ) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            table: table.into(),
            column: column.into(),
            key_id: key_id.into(),
            flags: PayloadFlags::empty(),
            sealed,
            unique_index: None,
            match_index: None,
        }
    }

    /// Attaches the equality index.
    #[must_use]
    pub fn with_unique_index(mut self, index: Vec<u8>) -> Self {
        self.flags = self.flags.with_unique();
        self.unique_index = Some(index);
        self
    }

    /// Attaches the free-text index.
    #[must_use]
    pub fn with_match_index(mut self, filter: BloomFilter) -> Self {
        self.flags = self.flags.with_match();
        self.match_index = Some(filter);
        self
    }

    /// Returns the format version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the column name.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Returns the provider key identifier.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Returns the flags.
    #[must_use]
    pub const fn flags(&self) -> PayloadFlags {
        self.flags
    }

    /// Returns the sealed bytes.
    #[must_use]
    pub fn sealed(&self) -> &[u8] {
        &self.sealed
    }

    /// Returns the equality index, if issued.
    #[must_use]
    pub fn unique_index(&self) -> Option<&[u8]> {
        self.unique_index.as_deref()
    }

    /// Returns the free-text index, if issued.
    #[must_use]
    pub const fn match_index(&self) -> Option<&BloomFilter> {
        self.match_index.as_ref()
    }

    /// Encryption context recorded in the payload.
    #[must_use]
    pub fn context(&self) -> EncryptionContext {
        EncryptionContext::new(self.table.clone(), self.column.clone()).with_version(self.version)
    }

    /// Serializes the header and sealed bytes.
    ///
    /// Indexes are not part of the binary form.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if a name or the key id exceeds 255 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = Vec::with_capacity(
            5 + self.table.len() + self.column.len() + self.key_id.len() + self.sealed.len(),
        );

        bytes.push(self.version);
        bytes.push(self.flags.as_u8());
        let fields = [("table", &self.table), ("column", &self.column), ("key id", &self.key_id)];
        for (what, field) in fields {
            let len = u8::try_from(field.len()).map_err(|_| {
                Error::Encryption(format!("{what} too long: {} bytes (max: 255)", field.len()))
            })?;
            bytes.push(len);
            bytes.extend_from_slice(field.as_bytes());
        }
        bytes.extend_from_slice(&self.sealed);

        Ok(bytes)
    }

    /// Deserializes a payload produced by [`to_bytes`](Self::to_bytes).
    ///
    /// The result has no indexes attached.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedVersion` for unknown versions and
    /// `Error::IntegrityViolation` if the data is truncated or malformed.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader { data, pos: 0 };

        let version = reader.byte("version")?;
        if version != PAYLOAD_VERSION {
            return Err(Error::UnsupportedVersion { version, supported: PAYLOAD_VERSION });
        }
        let flags = PayloadFlags::from_u8(reader.byte("flags")?)?;
        let table = reader.string("table")?;
        let column = reader.string("column")?;
        let key_id = reader.string("key id")?;
        let sealed = data[reader.pos..].to_vec();

        if sealed.is_empty() {
            return Err(Error::IntegrityViolation("payload has no sealed data".to_string()));
        }

        Ok(Self {
            version,
            table,
            column,
            key_id,
            flags,
            sealed,
            unique_index: None,
            match_index: None,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self, what: &str) -> Result<u8, Error> {
        let b = *self.data.get(self.pos).ok_or_else(|| {
            Error::IntegrityViolation(format!("payload truncated: missing {what}"))
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn string(&mut self, what: &str) -> Result<String, Error> {
        let len = usize::from(self.byte(what)?);
        let end = self.pos + len;
        let raw = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| Error::IntegrityViolation(format!("payload truncated: {what}")))?;
        self.pos = end;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::IntegrityViolation(format!("{what} is not UTF-8")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_flags() {
        let flags = PayloadFlags::empty();
        assert!(!flags.has_unique());
        assert!(!flags.has_match());

        let flags = flags.with_unique().with_match();
        assert!(flags.has_unique());
        assert!(flags.has_match());
        assert_eq!(flags.as_u8(), 3);
        assert!(PayloadFlags::from_u8(0x80).is_err());
    }

    #[test]
    fn test_payload_serialization() {
        let payload = CiphertextPayload::new("users", "email", "local-00ff", vec![9; 40])
            .with_unique_index(vec![1; 16]);

        let bytes = payload.to_bytes().expect("Failed to serialize payload");
        let parsed = CiphertextPayload::from_bytes(&bytes).expect("Failed to parse payload");

        assert_eq!(parsed.table(), "users");
        assert_eq!(parsed.column(), "email");
        assert_eq!(parsed.key_id(), "local-00ff");
        assert_eq!(parsed.sealed(), &[9; 40]);
        assert!(parsed.flags().has_unique());
        // Indexes live outside the binary form
        assert_eq!(parsed.unique_index(), None);
    }

    #[test]
    fn test_payload_unsupported_version() {
        let mut bytes =
            CiphertextPayload::new("users", "email", "k", vec![1, 2, 3]).to_bytes().unwrap();
        bytes[0] = 99;

        let result = CiphertextPayload::from_bytes(&bytes);
        assert!(matches!(result, Err(Error::UnsupportedVersion { version: 99, .. })));
    }

    #[test]
    fn test_payload_truncated_data() {
        let bytes = vec![PAYLOAD_VERSION, 0, 5, b'u'];
        assert!(matches!(CiphertextPayload::from_bytes(&bytes), Err(Error::IntegrityViolation(_))));
        assert!(matches!(CiphertextPayload::from_bytes(&[]), Err(Error::IntegrityViolation(_))));
    }

    #[test]
    fn test_payload_without_sealed_data() {
        let bytes = CiphertextPayload::new("users", "email", "k", Vec::new()).to_bytes().unwrap();
        assert!(matches!(CiphertextPayload::from_bytes(&bytes), Err(Error::IntegrityViolation(_))));
    }

    #[test]
    fn test_payload_name_too_long() {
        let payload = CiphertextPayload::new("t".repeat(256), "c", "k", vec![1]);
        assert!(matches!(payload.to_bytes(), Err(Error::Encryption(_))));
    }

    #[test]
    fn test_payload_context() {
        let payload = CiphertextPayload::new("users", "name", "k", vec![1]);
        assert_eq!(payload.context().to_string(), "users|name|v1");
    }
}
