//! Codec for field encryption and decryption.
//!
//! The codec seals a value through the provider, attaches the write-time
//! search indexes, and opens payloads again after checking they belong to the
//! expected column.

use crate::batch::BatchResult;
use crate::config::Limits;
use crate::context::EncryptionContext;
use crate::dispatch::{CallError, CallGuard};
use crate::error::{Error, ProviderError};
use crate::payload::CiphertextPayload;
use crate::policy::ColumnPolicy;
use crate::provider::{CryptoProvider, DecryptRequest};
use crate::terms::TermGenerator;
use crate::value::PlaintextValue;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

/// Codec for field-level encryption.
///
/// Encryption is randomized, so the same value sealed twice yields different
/// payloads; the unique index attached to both is identical.
///
/// # Example
///
/// ```ignore
/// use fieldseal::codec::Codec;
/// use fieldseal::config::Limits;
/// use fieldseal::policy::ColumnPolicy;
/// use fieldseal_local::LocalProvider;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let codec = Codec::new(LocalProvider::generate(), Limits::default());
/// let email = ColumnPolicy::new("users", "email").equality();
///
/// let payload = codec.encrypt(&"alice@example.com".into(), &email).await?;
/// let value = codec.decrypt(&payload, &email).await?;
/// assert_eq!(value.as_str(), Some("alice@example.com"));
/// # Ok(())
/// # }
/// ```
pub struct Codec<P: CryptoProvider> {
    provider: Arc<P>,
    terms: TermGenerator<P>,
    guard: CallGuard,
}

impl<P: CryptoProvider> Codec<P> {
    /// Creates a codec owning the provider.
    pub fn new(provider: P, limits: Limits) -> Self {
        Self::from_shared(Arc::new(provider), limits)
    }

    /// Creates a codec over a shared provider.
    pub fn from_shared(provider: Arc<P>, limits: Limits) -> Self {
        let guard = CallGuard::new(limits);
        Self { terms: TermGenerator::new(Arc::clone(&provider), guard.clone()), provider, guard }
    }

    /// Returns a codec whose calls abort when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        self.rebind(self.guard.with_cancellation(token))
    }

    /// Returns a codec whose calls abort after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.rebind(self.guard.with_timeout(timeout))
    }

    fn rebind(&self, guard: CallGuard) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            terms: TermGenerator::new(Arc::clone(&self.provider), guard.clone()),
            guard,
        }
    }

    /// Returns the term generator sharing this codec's provider and limits.
    #[must_use]
    pub const fn terms(&self) -> &TermGenerator<P> {
        &self.terms
    }

    /// Returns the active limits.
    #[must_use]
    pub fn limits(&self) -> &Limits {
        self.guard.limits()
    }

    /// Encrypts a value for a column.
    ///
    /// Sealing and index derivation run concurrently.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if the provider fails after retries,
    /// `Error::IndexGeneration` if the indexes cannot be derived, and
    /// `Error::Cancelled` if the call was cancelled.
    pub async fn encrypt(
        &self,
        value: &PlaintextValue,
        policy: &ColumnPolicy,
    ) -> Result<CiphertextPayload, Error> {
        let context = policy.context();
        let plaintext = value.to_bytes();

        let seal = async {
            self.guard
                .run("encrypt", || self.provider.encrypt(&plaintext, &context))
                .await
                .map_err(|e| match e {
                    CallError::Cancelled => Error::Cancelled,
                    CallError::Provider(err) => Error::Encryption(err.to_string()),
                })
        };
        let (sealed, indexes) = tokio::try_join!(seal, self.terms.write_indexes(value, policy))?;

        let mut payload = CiphertextPayload::new(
            policy.table(),
            policy.column(),
            sealed.key_id,
            sealed.ciphertext,
        );
        if let Some(unique) = indexes.unique {
            payload = payload.with_unique_index(unique);
        }
        if let Some(filter) = indexes.matching {
            payload = payload.with_match_index(filter);
        }

        debug!(table = policy.table(), column = policy.column(), "field encrypted");
        Ok(payload)
    }

    /// Decrypts a payload expected to belong to `policy`'s column.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` if the payload belongs to another column or
    /// the provider fails, `Error::IntegrityViolation` if authentication fails
    /// or the plaintext encoding is corrupt, and `Error::Cancelled` if the call
    /// was cancelled.
    pub async fn decrypt(
        &self,
        payload: &CiphertextPayload,
        policy: &ColumnPolicy,
    ) -> Result<PlaintextValue, Error> {
        check_binding(payload, policy)?;
        let context = payload.context();
        let request = request_for(payload, &context);

        let plaintext = self
            .guard
            .run("decrypt", || self.provider.decrypt(request))
            .await
            .map_err(|e| decrypt_error(payload, e))?;

        decode(payload, &plaintext)
    }

    /// Decrypts many payloads, reporting an outcome per item in input order.
    ///
    /// Items are grouped into `batch_size` chunks sent through
    /// [`CryptoProvider::decrypt_bulk`], up to `max_in_flight` chunks at a
    /// time. When a chunk fails as a whole its items are retried individually
    /// and concurrently, so a single corrupt payload only fails itself.
    pub async fn bulk_decrypt(
        &self,
        items: &[(&CiphertextPayload, &ColumnPolicy)],
    ) -> BatchResult<PlaintextValue> {
        let limits = self.guard.limits();
        let chunks: Vec<Vec<Result<PlaintextValue, Error>>> =
            stream::iter(items.chunks(limits.batch_size.max(1)))
                .map(|chunk| self.decrypt_chunk(chunk))
                .buffered(limits.max_in_flight.max(1))
                .collect()
                .await;

        let batch: BatchResult<PlaintextValue> = chunks.into_iter().flatten().collect();
        debug!(items = batch.len(), failed = batch.failure_count(), "bulk decrypt finished");
        batch
    }

    async fn decrypt_chunk(
        &self,
        chunk: &[(&CiphertextPayload, &ColumnPolicy)],
    ) -> Vec<Result<PlaintextValue, Error>> {
        let mut results: Vec<Option<Result<PlaintextValue, Error>>> =
            Vec::with_capacity(chunk.len());
        let mut pending = Vec::new();
        for (i, (payload, policy)) in chunk.iter().enumerate() {
            match check_binding(payload, policy) {
                Ok(()) => {
                    results.push(None);
                    pending.push(i);
                }
                Err(err) => results.push(Some(Err(err))),
            }
        }

        if !pending.is_empty() {
            let contexts: Vec<EncryptionContext> =
                pending.iter().map(|&i| chunk[i].0.context()).collect();
            let requests: Vec<DecryptRequest<'_>> = pending
                .iter()
                .zip(&contexts)
                .map(|(&i, ctx)| request_for(chunk[i].0, ctx))
                .collect();

            let bulk = self.guard.run("decrypt_bulk", || self.provider.decrypt_bulk(&requests));
            match bulk.await {
                Ok(plaintexts) if plaintexts.len() == requests.len() => {
                    for (&i, plaintext) in pending.iter().zip(plaintexts) {
                        results[i] = Some(decode(chunk[i].0, &plaintext));
                    }
                }
                Err(CallError::Cancelled) => {
                    for &i in &pending {
                        results[i] = Some(Err(Error::Cancelled));
                    }
                }
                outcome => {
                    match outcome {
                        Err(CallError::Provider(err)) => {
                            debug!(items = pending.len(), error = %err, "bulk call failed");
                        }
                        _ => debug!(items = pending.len(), "bulk call returned wrong item count"),
                    }
                    let isolated: Vec<_> = stream::iter(pending.iter().copied())
                        .map(|i| {
                            let (payload, policy) = chunk[i];
                            async move { (i, self.decrypt(payload, policy).await) }
                        })
                        .buffered(self.guard.limits().max_in_flight.max(1))
                        .collect()
                        .await;
                    for (i, outcome) in isolated {
                        results[i] = Some(outcome);
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(Error::Decryption("item was not processed".to_string())))
            })
            .collect()
    }
}

impl<P: CryptoProvider> Clone for Codec<P> {
    fn clone(&self) -> Self {
        self.rebind(self.guard.clone())
    }
}

fn request_for<'a>(
    payload: &'a CiphertextPayload,
    context: &'a EncryptionContext,
) -> DecryptRequest<'a> {
    DecryptRequest { key_id: payload.key_id(), ciphertext: payload.sealed(), context }
}

fn check_binding(payload: &CiphertextPayload, policy: &ColumnPolicy) -> Result<(), Error> {
    if payload.table() != policy.table() || payload.column() != policy.column() {
        return Err(Error::Decryption(format!(
            "payload belongs to {}.{}, expected {}.{}",
            payload.table(),
            payload.column(),
            policy.table(),
            policy.column()
        )));
    }
    Ok(())
}

fn decrypt_error(payload: &CiphertextPayload, err: CallError) -> Error {
    match err {
        CallError::Cancelled => Error::Cancelled,
        CallError::Provider(ProviderError::Rejected) => Error::integrity_violation(
            payload.table(),
            payload.column(),
            "authentication tag mismatch".to_string(),
        ),
        CallError::Provider(err) => Error::Decryption(err.to_string()),
    }
}

fn decode(
    payload: &CiphertextPayload,
    plaintext: &Zeroizing<Vec<u8>>,
) -> Result<PlaintextValue, Error> {
    PlaintextValue::from_bytes(plaintext).map_err(|e| match e {
        Error::IntegrityViolation(detail) => {
            Error::integrity_violation(payload.table(), payload.column(), detail)
        }
        other => other,
    })
}
