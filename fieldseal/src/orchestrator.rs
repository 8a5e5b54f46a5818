//! Record-level encryption and decryption driven by the table policies.

use crate::batch::BatchResult;
use crate::codec::Codec;
use crate::error::Error;
use crate::policy::{ColumnPolicy, Schema};
use crate::provider::CryptoProvider;
use crate::record::{Field, Record};
use crate::storage::{self, StorageRow};
use crate::value::PlaintextValue;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Walks records and applies the codec to every declared column.
///
/// The orchestrator only decides which fields to touch; algorithms and key
/// handling stay in the [`Codec`].
pub struct Orchestrator<P: CryptoProvider> {
    codec: Codec<P>,
    schema: Arc<Schema>,
}

impl<P: CryptoProvider> Orchestrator<P> {
    /// Creates an orchestrator for a schema.
    pub fn new(codec: Codec<P>, schema: Schema) -> Self {
        Self { codec, schema: Arc::new(schema) }
    }

    /// Returns an orchestrator whose calls abort when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self { codec: self.codec.with_cancellation(token), schema: Arc::clone(&self.schema) }
    }

    /// Returns the codec.
    #[must_use]
    pub const fn codec(&self) -> &Codec<P> {
        &self.codec
    }

    /// Returns the schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Encrypts every declared plaintext field of a record.
    ///
    /// Fields are encrypted concurrently. Undeclared and already encrypted
    /// fields pass through unchanged.
    ///
    /// # Errors
    ///
    /// Fails closed: returns the first field error and no partial record.
    /// Returns `Error::PolicyNotFound` if the table is not declared.
    pub async fn encrypt_record(&self, mut record: Record, table: &str) -> Result<Record, Error> {
        let table_policy = self.schema.table_policy(table)?;

        let pending: Vec<(String, &PlaintextValue, &ColumnPolicy)> = record
            .fields()
            .filter_map(|(column, field)| match field {
                Field::Plain(value) => {
                    table_policy.get(column).map(|policy| (column.to_string(), value, policy))
                }
                Field::Encrypted(_) => None,
            })
            .collect();

        let encrypted: Vec<_> = stream::iter(pending)
            .map(|(column, value, policy)| async move {
                self.codec.encrypt(value, policy).await.map(|payload| (column, payload))
            })
            .buffered(self.codec.limits().max_in_flight.max(1))
            .try_collect()
            .await
            .map_err(|e| {
                warn!(table, id = record.id(), error = %e, "record encryption aborted");
                e
            })?;

        let count = encrypted.len();
        for (column, payload) in encrypted {
            record.set_encrypted(column, payload);
        }
        debug!(table, id = record.id(), fields = count, "record encrypted");
        Ok(record)
    }

    /// Encrypts many records, reporting an outcome per record.
    ///
    /// Records and their fields fan out concurrently; provider calls across
    /// all of them stay within `max_in_flight`.
    pub async fn encrypt_records(&self, records: Vec<Record>, table: &str) -> BatchResult<Record> {
        stream::iter(records)
            .map(|record| self.encrypt_record(record, table))
            .buffered(self.codec.limits().max_in_flight.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect()
    }

    /// Decrypts the encrypted fields of many records with one bulk decrypt.
    ///
    /// A record fails with the first error among its fields; other records
    /// are unaffected. Output order equals input order.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyNotFound` if the table is not declared.
    pub async fn decrypt_records(
        &self,
        mut records: Vec<Record>,
        table: &str,
    ) -> Result<BatchResult<Record>, Error> {
        let table_policy = self.schema.table_policy(table)?;
        let mut failed: Vec<Option<Error>> = records.iter().map(|_| None).collect();
        let mut slots = Vec::new();
        let mut items = Vec::new();

        for (index, record) in records.iter().enumerate() {
            for (column, field) in record.fields() {
                let Field::Encrypted(payload) = field else { continue };
                match table_policy.get(column) {
                    Some(policy) => {
                        slots.push((index, column.to_string()));
                        items.push((payload, policy));
                    }
                    None => {
                        failed[index].get_or_insert_with(|| Error::policy_not_found(table, column));
                    }
                }
            }
        }

        let outcomes = self.codec.bulk_decrypt(&items).await;
        drop(items);

        for ((index, column), outcome) in slots.into_iter().zip(outcomes) {
            match outcome {
                Ok(value) => records[index].set_plain(column, value),
                Err(err) => {
                    failed[index].get_or_insert(err);
                }
            }
        }

        let batch: BatchResult<Record> = records
            .into_iter()
            .zip(failed)
            .map(|(record, failure)| failure.map_or(Ok(record), Err))
            .collect();

        if batch.is_complete() {
            debug!(table, records = batch.len(), "records decrypted");
        } else {
            warn!(
                table,
                records = batch.len(),
                failed = batch.failure_count(),
                "some records failed to decrypt"
            );
        }
        Ok(batch)
    }

    /// Returns `true` if every declared column present in the record is encrypted.
    ///
    /// # Errors
    ///
    /// Returns `Error::PolicyNotFound` if the table is not declared.
    pub fn is_encryption_complete(&self, record: &Record, table: &str) -> Result<bool, Error> {
        Ok(record.is_encryption_complete(self.schema.table_policy(table)?))
    }

    /// Converts a record to its storage form.
    ///
    /// # Errors
    ///
    /// See [`storage::to_storage_form`].
    pub fn to_storage_form(&self, record: &Record) -> Result<StorageRow, Error> {
        storage::to_storage_form(record)
    }

    /// Rebuilds a record from its storage form.
    ///
    /// # Errors
    ///
    /// See [`storage::from_storage_form`].
    pub fn from_storage_form(&self, row: &StorageRow) -> Result<Record, Error> {
        storage::from_storage_form(row)
    }
}

impl<P: CryptoProvider> Clone for Orchestrator<P> {
    fn clone(&self) -> Self {
        Self { codec: self.codec.clone(), schema: Arc::clone(&self.schema) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::payload::CiphertextPayload;
    use crate::policy::TablePolicy;
    use crate::testing::MockProvider;
    use std::time::Duration;

    fn schema() -> Schema {
        Schema::new().table(
            TablePolicy::new("users")
                .column(ColumnPolicy::new("users", "email").equality().free_text_search())
                .column(ColumnPolicy::new("users", "name").equality().free_text_search()),
        )
    }

    fn orchestrator(provider: MockProvider) -> Orchestrator<MockProvider> {
        let limits = Limits { retry_base_delay_ms: 1, ..Limits::default() };
        Orchestrator::new(Codec::new(provider, limits), schema())
    }

    fn alice() -> Record {
        Record::new(1).with("email", "a@x.com").with("name", "Alice").with("plan", "free")
    }

    #[tokio::test]
    async fn test_encrypt_record_declared_fields_only() {
        let orch = orchestrator(MockProvider::new());
        let record = orch.encrypt_record(alice(), "users").await.unwrap();

        assert!(record.payload("email").is_some());
        assert!(record.payload("name").is_some());
        assert_eq!(record.plain("plan"), Some(&PlaintextValue::from("free")));
        assert!(orch.is_encryption_complete(&record, "users").unwrap());
    }

    #[tokio::test]
    async fn test_encrypt_record_unknown_table() {
        let orch = orchestrator(MockProvider::new());
        let result = orch.encrypt_record(alice(), "orders").await;
        assert!(matches!(result, Err(Error::PolicyNotFound { .. })));
    }

    #[tokio::test]
    async fn test_encrypt_record_fails_closed() {
        let provider = MockProvider::new();
        let orch = orchestrator(provider.clone());
        provider.fail_next(100);

        let result = orch.encrypt_record(alice(), "users").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_encrypt_is_idempotent_on_encrypted_fields() {
        let provider = MockProvider::new();
        let orch = orchestrator(provider.clone());
        let once = orch.encrypt_record(alice(), "users").await.unwrap();
        let calls = provider.encrypt_calls();

        let twice = orch.encrypt_record(once.clone(), "users").await.unwrap();
        assert_eq!(twice, once);
        assert_eq!(provider.encrypt_calls(), calls);
    }

    #[tokio::test]
    async fn test_decrypt_records_preserves_order() {
        let orch = orchestrator(MockProvider::new());
        let mut encrypted = Vec::new();
        for (id, name) in [(1, "Alice"), (2, "Bob"), (3, "Carol")] {
            let record = Record::new(id).with("name", name);
            encrypted.push(orch.encrypt_record(record, "users").await.unwrap());
        }

        let batch = orch.decrypt_records(encrypted, "users").await.unwrap();
        let names: Vec<_> = batch
            .into_result()
            .unwrap()
            .iter()
            .map(|r| (r.id(), r.plain("name").unwrap().to_string()))
            .collect();
        let expected: Vec<(i64, String)> =
            [(1, "Alice"), (2, "Bob"), (3, "Carol")].map(|(id, n)| (id, n.to_string())).into();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_decrypt_records_isolates_corrupt_record() {
        let orch = orchestrator(MockProvider::new());
        let mut encrypted = Vec::new();
        for id in 1..=4 {
            let record = Record::new(id).with("email", format!("user{id}@x.com")).with("name", "N");
            encrypted.push(orch.encrypt_record(record, "users").await.unwrap());
        }

        let payload = encrypted[1].payload("email").unwrap();
        let mut bytes = payload.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        encrypted[1].set_encrypted("email", CiphertextPayload::from_bytes(&bytes).unwrap());

        let batch = orch.decrypt_records(encrypted, "users").await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.failure_count(), 1);
        let (index, err) = batch.failures().next().unwrap();
        assert_eq!(index, 1);
        assert!(matches!(err, Error::IntegrityViolation(_)));
        assert_eq!(batch.successes().map(Record::id).collect::<Vec<_>>(), vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_decrypt_records_undeclared_encrypted_column() {
        let orch = orchestrator(MockProvider::new());
        let mut record = Record::new(1);
        record.set_encrypted("ssn", CiphertextPayload::new("users", "ssn", "mock", vec![1; 32]));

        let batch = orch.decrypt_records(vec![record], "users").await.unwrap();
        assert!(matches!(batch.items()[0], Err(Error::PolicyNotFound { .. })));
    }

    #[tokio::test]
    async fn test_decrypt_records_empty() {
        let orch = orchestrator(MockProvider::new());
        let batch = orch.decrypt_records(Vec::new(), "users").await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_encrypt_records_batch() {
        let provider = MockProvider::new();
        let orch = orchestrator(provider);
        let records = vec![alice(), Record::new(2).with("name", "Bob")];
        let batch = orch.encrypt_records(records, "users").await;
        assert!(batch.is_complete());
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_encrypt_records_respects_max_in_flight() {
        let provider = MockProvider::new();
        provider.set_delay(Duration::from_millis(5));
        let limits = Limits { max_in_flight: 2, ..Limits::default() };
        let orch = Orchestrator::new(Codec::new(provider.clone(), limits), schema());

        let records = (0..8)
            .map(|id| Record::new(id).with("email", format!("user{id}@x.com")).with("name", "N"))
            .collect();
        let batch = orch.encrypt_records(records, "users").await;

        assert!(batch.is_complete());
        assert_eq!(provider.encrypt_calls(), 16);
        assert_eq!(provider.peak_concurrency(), 2);
    }
}
