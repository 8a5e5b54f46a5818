//! Error types for `fieldseal` operations.

use std::fmt;

/// Main error type for `fieldseal` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No policy is declared for the table/column
    #[error("no policy declared for {table}.{column}")]
    PolicyNotFound {
        /// Table name requested
        table: String,
        /// Column name requested (empty when the table itself is unknown)
        column: String,
    },

    /// The column policy does not enable the requested capability
    #[error("column {column} does not support {capability} search")]
    UnsupportedSearchMode {
        /// Column the term was requested for
        column: String,
        /// Capability that is missing
        capability: String,
    },

    /// Encryption failed at the service boundary
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed, or the payload belongs to another column
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Payload is malformed or its authentication tag did not verify
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Payload was written by an unknown format version
    #[error("unsupported payload version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the payload
        version: u8,
        /// Supported version
        supported: u8,
    },

    /// Predicate combines terms and operators that cannot be evaluated together
    #[error("invalid predicate composition: {0}")]
    InvalidPredicateComposition(String),

    /// Search term derivation failed
    #[error("search term derivation failed: {0}")]
    IndexGeneration(String),

    /// Record shape does not fit the requested conversion
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Backing store rejected the operation
    #[error("store error: {0}")]
    Store(String),

    /// Configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Caller cancelled the operation or its deadline expired
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Builds a `PolicyNotFound` error.
    #[must_use]
    pub fn policy_not_found(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::PolicyNotFound { table: table.into(), column: column.into() }
    }

    /// Builds an `IntegrityViolation` error and logs it on the
    /// `fieldseal::integrity` target.
    pub(crate) fn integrity_violation(table: &str, column: &str, detail: String) -> Self {
        tracing::error!(
            target: "fieldseal::integrity",
            table,
            column,
            %detail,
            "integrity violation"
        );
        Self::IntegrityViolation(detail)
    }

    /// Returns `true` for service-level failures that a caller may retry.
    ///
    /// Integrity violations, policy errors and cancellation are final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Encryption(_) | Self::Decryption(_) | Self::IndexGeneration(_))
    }
}

/// Errors reported by a [`CryptoProvider`](crate::provider::CryptoProvider).
#[derive(Debug)]
pub enum ProviderError {
    /// Service temporarily unavailable; safe to retry
    Unavailable(String),

    /// Key referenced by the payload is not known to the provider
    KeyNotFound(String),

    /// Authentication tag did not verify
    Rejected,

    /// Permanent failure
    Failed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl ProviderError {
    /// Returns `true` if the call may succeed when repeated.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
            Self::KeyNotFound(id) => write!(f, "key not found: {id}"),
            Self::Rejected => {
                write!(f, "authentication failed: ciphertext may be corrupted or tampered")
            }
            Self::Failed(msg) => write!(f, "provider failure: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
