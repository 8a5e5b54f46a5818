//! Process configuration: column policies and service-call limits.
//!
//! ```toml
//! [limits]
//! max_in_flight = 8
//! max_attempts = 3
//!
//! [[tables]]
//! name = "users"
//!
//! [[tables.columns]]
//! name = "email"
//! capabilities = ["equality", "free_text_search", "order_and_range"]
//! ```

use crate::error::Error;
use crate::policy::{Capability, ColumnPolicy, MatchOptions, Schema, TablePolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default maximum number of concurrent provider calls per bulk operation.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;
/// Default number of payloads sent in one `decrypt_bulk` call.
pub const DEFAULT_BATCH_SIZE: usize = 64;
/// Default attempts per provider call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default backoff before the first retry.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 50;

/// Bounds on provider traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Max provider calls in flight per bulk operation (range: 1-256).
    pub max_in_flight: usize,
    /// Payloads per `decrypt_bulk` call (range: 1-10000).
    pub batch_size: usize,
    /// Attempts per call for transient failures (range: 1-10).
    pub max_attempts: u32,
    /// Backoff before the first retry, doubled per attempt.
    pub retry_base_delay_ms: u64,
    /// Deadline covering every attempt of one provider call. `None` waits indefinitely.
    pub call_timeout_ms: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            call_timeout_ms: None,
        }
    }
}

impl Limits {
    /// Checks every limit is in range.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending key.
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=256).contains(&self.max_in_flight) {
            return Err(Error::Config(format!(
                "limits.max_in_flight must be in [1, 256], got {}",
                self.max_in_flight
            )));
        }
        if !(1..=10_000).contains(&self.batch_size) {
            return Err(Error::Config(format!(
                "limits.batch_size must be in [1, 10000], got {}",
                self.batch_size
            )));
        }
        if !(1..=10).contains(&self.max_attempts) {
            return Err(Error::Config(format!(
                "limits.max_attempts must be in [1, 10], got {}",
                self.max_attempts
            )));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(Error::Config("limits.call_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Deadline covering every attempt of one provider call.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

/// One encrypted column in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// Column name.
    pub name: String,
    /// Enabled search capabilities.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// Free-text tokenizer options.
    #[serde(default, rename = "match")]
    pub match_options: MatchOptions,
}

/// One table in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name.
    pub name: String,
    /// Encrypted columns.
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Provider traffic limits.
    #[serde(default)]
    pub limits: Limits,
    /// Encrypted tables.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl Config {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on syntax errors or invalid values.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks limits, names and match options.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first problem.
    pub fn validate(&self) -> Result<(), Error> {
        self.limits.validate()?;

        let mut tables = BTreeSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                return Err(Error::Config("table name must not be empty".to_string()));
            }
            if !tables.insert(table.name.as_str()) {
                return Err(Error::Config(format!("table {} declared twice", table.name)));
            }
            let mut columns = BTreeSet::new();
            for column in &table.columns {
                if column.name.is_empty() {
                    return Err(Error::Config(format!("table {}: empty column name", table.name)));
                }
                if !columns.insert(column.name.as_str()) {
                    return Err(Error::Config(format!(
                        "column {}.{} declared twice",
                        table.name, column.name
                    )));
                }
                column.match_options.validate().map_err(|e| match e {
                    Error::Config(msg) => {
                        Error::Config(format!("{}.{}: {msg}", table.name, column.name))
                    }
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    /// Builds the immutable schema described by this config.
    #[must_use]
    pub fn schema(&self) -> Schema {
        self.tables.iter().fold(Schema::new(), |schema, table| {
            let policy = table.columns.iter().fold(TablePolicy::new(&table.name), |t, c| {
                let column = c
                    .capabilities
                    .iter()
                    .fold(ColumnPolicy::new(&table.name, &c.name), |p, cap| p.with_capability(*cap))
                    .with_match_options(c.match_options);
                t.column(column)
            });
            schema.table(policy)
        })
    }
}
