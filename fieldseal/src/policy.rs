//! Static declaration of encrypted columns and their search capabilities.
//!
//! Policies are built once at startup, either in code or from
//! [`Config`](crate::config::Config), and shared read-only afterwards.

use crate::context::EncryptionContext;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Search capability a column may enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Exact match through a blind index
    Equality,
    /// `ilike`-style matching through an n-gram bloom filter
    FreeTextSearch,
    /// Ordering and range comparisons
    OrderAndRange,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equality => "equality",
            Self::FreeTextSearch => "free-text",
            Self::OrderAndRange => "order/range",
        })
    }
}

/// Tokenizer and bloom filter parameters for free-text columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    /// Length of the n-grams fed to the filter.
    pub ngram: usize,
    /// Number of bits in the bloom filter.
    pub filter_bits: u16,
    /// Bits set per token.
    pub hash_count: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self { ngram: 3, filter_bits: 256, hash_count: 3 }
    }
}

impl MatchOptions {
    /// Checks the options are usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a parameter is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=8).contains(&self.ngram) {
            return Err(Error::Config(format!("match.ngram must be in [1, 8], got {}", self.ngram)));
        }
        if !(32..=8192).contains(&self.filter_bits) {
            return Err(Error::Config(format!(
                "match.filter_bits must be in [32, 8192], got {}",
                self.filter_bits
            )));
        }
        // Each position consumes two bytes of a 32-byte tag.
        if !(1..=16).contains(&self.hash_count) {
            return Err(Error::Config(format!(
                "match.hash_count must be in [1, 16], got {}",
                self.hash_count
            )));
        }
        Ok(())
    }
}

/// Policy for one encrypted column.
///
/// # Example
///
/// ```
/// use fieldseal::policy::{Capability, ColumnPolicy};
///
/// let email = ColumnPolicy::new("users", "email").equality().free_text_search();
/// assert!(email.supports(Capability::Equality));
/// assert!(!email.supports(Capability::OrderAndRange));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPolicy {
    table: String,
    column: String,
    capabilities: BTreeSet<Capability>,
    match_options: MatchOptions,
}

impl ColumnPolicy {
    /// Creates a policy with no search capabilities (encrypt/decrypt only).
    #[must_use]
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            capabilities: BTreeSet::new(),
            match_options: MatchOptions::default(),
        }
    }

    /// Enables equality search.
    #[must_use]
    pub fn equality(self) -> Self {
        self.with_capability(Capability::Equality)
    }

    /// Enables free-text search.
    #[must_use]
    pub fn free_text_search(self) -> Self {
        self.with_capability(Capability::FreeTextSearch)
    }

    /// Enables order and range search.
    #[must_use]
    pub fn order_and_range(self) -> Self {
        self.with_capability(Capability::OrderAndRange)
    }

    /// Enables a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Overrides the free-text tokenizer options.
    #[must_use]
    pub const fn with_match_options(mut self, options: MatchOptions) -> Self {
        self.match_options = options;
        self
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

    /// Returns the enabled capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Returns whether the capability is enabled.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Returns the free-text tokenizer options.
    #[must_use]
    pub const fn match_options(&self) -> &MatchOptions {
        &self.match_options
    }

    /// Encryption context bound into every payload of this column.
    #[must_use]
    pub fn context(&self) -> EncryptionContext {
        EncryptionContext::new(self.table.clone(), self.column.clone())
    }
}

/// Encrypted columns of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePolicy {
    name: String,
    columns: BTreeMap<String, ColumnPolicy>,
}

impl TablePolicy {
    /// Creates an empty table policy.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), columns: BTreeMap::new() }
    }

    /// Declares an encrypted column, returning the builder.
    ///
    /// The column's table name is replaced by this table's name.
    #[must_use]
    pub fn column(mut self, mut policy: ColumnPolicy) -> Self {
        policy.table.clone_from(&self.name);
        self.columns.insert(policy.column.clone(), policy);
        self
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up an encrypted column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&ColumnPolicy> {
        self.columns.get(column)
    }

    /// Iterates declared columns in name order.
    pub fn columns(&self) -> impl Iterator<Item = &ColumnPolicy> {
        self.columns.values()
    }

    /// Returns whether the column is declared as encrypted.
    #[must_use]
    pub fn is_encrypted(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }
}

/// All table policies known to the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    tables: BTreeMap<String, TablePolicy>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table policy, returning the builder.
    #[must_use]
    pub fn table(mut self, table: TablePolicy) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Looks up a table policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyNotFound` if the table is not declared.
    pub fn table_policy(&self, table: &str) -> Result<&TablePolicy, Error> {
        self.tables.get(table).ok_or_else(|| Error::policy_not_found(table, ""))
    }

    /// Looks up a column policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyNotFound` if the table or column is not declared.
    pub fn column(&self, table: &str, column: &str) -> Result<&ColumnPolicy, Error> {
        self.table_policy(table)?
            .get(column)
            .ok_or_else(|| Error::policy_not_found(table, column))
    }

    /// Iterates declared tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TablePolicy> {
        self.tables.values()
    }
}
