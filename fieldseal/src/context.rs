//! Context types for encryption and indexing operations.

use std::fmt;

/// Context for encryption operations, used for key derivation and as associated data.
///
/// Binding the table and column into the context means a payload copied into
/// another column fails authentication instead of decrypting.
///
/// # Example
///
/// ```
/// use fieldseal::context::EncryptionContext;
///
/// let ctx = EncryptionContext::new("users", "email");
/// assert_eq!(ctx.to_string(), "users|email|v1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptionContext {
    table_name: String,
    column_name: String,
    version: u8,
}

impl EncryptionContext {
    /// Creates a new encryption context for the current payload version.
    #[must_use]
    pub fn new(table_name: impl Into<String>, column_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            column_name: column_name.into(),
            version: crate::payload::PAYLOAD_VERSION,
        }
    }

    /// Sets the payload format version the context belongs to.
    #[must_use]
    pub const fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Returns the table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Returns the column name.
    #[must_use]
    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    /// Returns the version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }
}

impl fmt::Display for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|v{}", self.table_name, self.column_name, self.version)
    }
}

/// Which searchable index a term belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Equality blind index
    Unique,
    /// N-gram tags feeding the match bloom filter
    Match,
}

impl IndexKind {
    /// Stable label used in derivation contexts.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unique => "unique",
            Self::Match => "match",
        }
    }
}

/// Context for search term derivation.
///
/// The index kind is part of the context, so the same plaintext never yields
/// the same tag for an equality index and a match index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexContext {
    table_name: String,
    column_name: String,
    kind: IndexKind,
}

impl IndexContext {
    /// Creates a new index context.
    #[must_use]
    pub fn new(
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        kind: IndexKind,
    ) -> Self {
        Self { table_name: table_name.into(), column_name: column_name.into(), kind }
    }

    /// Returns the table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Returns the column name.
    #[must_use]
    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    /// Returns the index kind.
    #[must_use]
    pub const fn kind(&self) -> IndexKind {
        self.kind
    }
}

impl fmt::Display for IndexContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.table_name, self.column_name, self.kind.label())
    }
}
