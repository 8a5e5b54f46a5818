//! Data-access client: insert, list and search over encrypted records.

use crate::batch::BatchResult;
use crate::error::Error;
use crate::orchestrator::Orchestrator;
use crate::predicate::Predicate;
use crate::provider::CryptoProvider;
use crate::record::{Model, Record};
use crate::storage::{self, StorageRow};
use crate::store::Store;
use crate::terms::{self, ReturnForm, TermQuery};
use crate::value::PlaintextValue;
use tracing::debug;

/// Comparison of one search filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Exact equality
    Equals,
    /// Case-insensitive `ilike` pattern, `%` and `_` as wildcards
    Like,
}

/// One condition of a search.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Column name
    pub column: String,
    /// Plaintext operand
    pub value: PlaintextValue,
    /// Comparison
    pub op: FilterOp,
}

impl Filter {
    /// Equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<PlaintextValue>) -> Self {
        Self { column: column.into(), value: value.into(), op: FilterOp::Equals }
    }

    /// Pattern filter.
    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: PlaintextValue::Text(pattern.into()),
            op: FilterOp::Like,
        }
    }

    /// Checks the filter against a decrypted record.
    #[must_use]
    pub fn accepts(&self, record: &Record) -> bool {
        let Some(value) = record.plain(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Equals => *value == self.value,
            FilterOp::Like => terms::ilike(&value.search_text(), &self.value.search_text()),
        }
    }

    const fn form(&self) -> ReturnForm {
        match self.op {
            FilterOp::Equals => ReturnForm::Exact,
            FilterOp::Like => ReturnForm::Pattern,
        }
    }
}

/// How several filters combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combine {
    /// Any filter matches
    #[default]
    Any,
    /// Every filter matches
    All,
}

impl Combine {
    /// Checks a decrypted record against `filters` combined this way.
    #[must_use]
    pub fn accepts(self, filters: &[Filter], record: &Record) -> bool {
        match self {
            Self::Any => filters.iter().any(|f| f.accepts(record)),
            Self::All => filters.iter().all(|f| f.accepts(record)),
        }
    }
}

/// Client over an orchestrator and a store.
pub struct Client<P: CryptoProvider, S: Store> {
    orchestrator: Orchestrator<P>,
    store: S,
}

impl<P: CryptoProvider, S: Store> Client<P, S> {
    /// Creates a client.
    pub const fn new(orchestrator: Orchestrator<P>, store: S) -> Self {
        Self { orchestrator, store }
    }

    /// Returns the orchestrator.
    pub const fn orchestrator(&self) -> &Orchestrator<P> {
        &self.orchestrator
    }

    /// Returns the store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Encrypts and stores a record, returning it as stored.
    ///
    /// # Errors
    ///
    /// Returns the encryption error for the first failing field, or
    /// `Error::Store` if the store rejects the row.
    pub async fn insert(&self, table: &str, record: Record) -> Result<StorageRow, Error> {
        let encrypted = self.orchestrator.encrypt_record(record, table).await?;
        let row = storage::to_storage_form(&encrypted)?;
        self.store.insert(table, row).await
    }

    /// Stores a model in its table.
    ///
    /// # Errors
    ///
    /// See [`insert`](Self::insert).
    pub async fn insert_model<M: Model>(&self, model: M) -> Result<StorageRow, Error> {
        self.insert(M::TABLE, model.into_record()).await
    }

    /// Lists and decrypts every record of a table.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store or the table policy fails; per-record
    /// failures are reported in the batch.
    pub async fn list(&self, table: &str) -> Result<BatchResult<Record>, Error> {
        let rows = self.store.select(table, None).await?;
        self.open_rows(&rows, table).await
    }

    /// Lists every record of a model's table.
    ///
    /// # Errors
    ///
    /// See [`list`](Self::list).
    pub async fn list_models<M: Model>(&self) -> Result<BatchResult<M>, Error> {
        Ok(self.list(M::TABLE).await?.and_then(M::from_record))
    }

    /// Searches a table with encrypted filters.
    ///
    /// All search terms are derived in one provider call. The store returns
    /// candidate rows from the encrypted indexes; after decryption only the
    /// records that satisfy the filters exactly are kept. Rows that fail to
    /// decrypt stay in the batch as errors. No matching row yields an empty
    /// batch, not an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyNotFound` for undeclared columns,
    /// `Error::UnsupportedSearchMode` if a column does not allow the filter,
    /// `Error::InvalidPredicateComposition` if `filters` is empty, and any
    /// term derivation or store error.
    pub async fn search(
        &self,
        table: &str,
        filters: &[Filter],
        combine: Combine,
    ) -> Result<BatchResult<Record>, Error> {
        let schema = self.orchestrator.schema();
        let queries = filters
            .iter()
            .map(|f| {
                let policy = schema.column(table, &f.column)?;
                Ok(TermQuery { value: &f.value, policy, form: f.form() })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let terms = self.orchestrator.codec().terms().derive_terms(&queries).await?;
        let predicates = filters
            .iter()
            .zip(&terms)
            .map(|(f, term)| match f.op {
                FilterOp::Equals => Predicate::equality(&f.column, term),
                FilterOp::Like => Predicate::pattern(&f.column, term),
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let predicate = match combine {
            Combine::Any => Predicate::or(predicates)?,
            Combine::All => Predicate::and(predicates)?,
        };

        let rows = self.store.select(table, Some(&predicate)).await?;
        let batch: BatchResult<Record> = self
            .open_rows(&rows, table)
            .await?
            .into_iter()
            .filter(|item| match item {
                Ok(record) => combine.accepts(filters, record),
                Err(_) => true,
            })
            .collect();
        debug!(
            table,
            filters = filters.len(),
            candidates = rows.len(),
            matched = batch.len(),
            "search finished"
        );
        Ok(batch)
    }

    /// Searches a model's table.
    ///
    /// # Errors
    ///
    /// See [`search`](Self::search).
    pub async fn search_models<M: Model>(
        &self,
        filters: &[Filter],
        combine: Combine,
    ) -> Result<BatchResult<M>, Error> {
        Ok(self.search(M::TABLE, filters, combine).await?.and_then(M::from_record))
    }

    /// Parses and decrypts rows, keeping one outcome per row in order.
    async fn open_rows(
        &self,
        rows: &[StorageRow],
        table: &str,
    ) -> Result<BatchResult<Record>, Error> {
        let mut records = Vec::with_capacity(rows.len());
        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            match storage::from_storage_form(row) {
                Ok(record) => {
                    records.push(record);
                    slots.push(None);
                }
                Err(err) => slots.push(Some(err)),
            }
        }

        let mut decrypted = self.orchestrator.decrypt_records(records, table).await?.into_iter();
        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Some(err) => Err(err),
                None => decrypted.next().unwrap_or_else(|| {
                    Err(Error::Decryption("record was not processed".to_string()))
                }),
            })
            .collect())
    }
}
