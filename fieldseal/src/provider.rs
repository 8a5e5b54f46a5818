//! Encryption service boundary.
//!
//! All cryptographic work is delegated to a [`CryptoProvider`]. The codec and
//! term generator only decide *what* to seal or tag; the provider owns the keys.

use crate::context::{EncryptionContext, IndexContext};
use crate::error::ProviderError;
use async_trait::async_trait;
use zeroize::Zeroizing;

/// Output of [`CryptoProvider::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Identifier of the key that sealed the data
    pub key_id: String,
    /// Provider-specific ciphertext (nonce, body and tag)
    pub ciphertext: Vec<u8>,
}

/// One item of a [`CryptoProvider::decrypt_bulk`] call.
#[derive(Debug, Clone, Copy)]
pub struct DecryptRequest<'a> {
    /// Key identifier recorded in the payload
    pub key_id: &'a str,
    /// Sealed bytes
    pub ciphertext: &'a [u8],
    /// Context the data was sealed under
    pub context: &'a EncryptionContext,
}

/// One item of a [`CryptoProvider::derive_terms`] call.
#[derive(Debug, Clone)]
pub struct TermRequest {
    /// Domain the tag is derived for
    pub context: IndexContext,
    /// Bytes to tag (encoded value or n-gram)
    pub input: Zeroizing<Vec<u8>>,
}

/// Provides encryption, decryption and keyed tagging.
///
/// Implementations must be thread-safe (`Send + Sync`) since the orchestrator
/// issues calls concurrently, and every method must be safe to retry.
///
/// # Example
///
/// ```rust,ignore
/// use fieldseal::provider::CryptoProvider;
///
/// struct MyService;
///
/// #[async_trait::async_trait]
/// impl CryptoProvider for MyService {
///     async fn encrypt(&self, plaintext: &[u8], context: &EncryptionContext)
///         -> Result<Sealed, ProviderError> {
///         // call out to the service
///     }
///     // ... other methods
/// }
/// ```
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Seals plaintext under the context.
    ///
    /// The context must be authenticated, so that sealed data only opens under
    /// the same context.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unavailable` for transient failures.
    async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Sealed, ProviderError>;

    /// Opens data sealed by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Rejected` if authentication fails and
    /// `ProviderError::KeyNotFound` if the key is unknown.
    async fn decrypt(
        &self,
        request: DecryptRequest<'_>,
    ) -> Result<Zeroizing<Vec<u8>>, ProviderError>;

    /// Opens many items in one call.
    ///
    /// The whole call fails if any item fails; callers needing per-item
    /// outcomes fall back to [`decrypt`](Self::decrypt). The default issues
    /// sequential single calls.
    ///
    /// # Errors
    ///
    /// Returns the first item error.
    async fn decrypt_bulk(
        &self,
        requests: &[DecryptRequest<'_>],
    ) -> Result<Vec<Zeroizing<Vec<u8>>>, ProviderError> {
        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            out.push(self.decrypt(*request).await?);
        }
        Ok(out)
    }

    /// Derives a deterministic keyed tag for each request, in order.
    ///
    /// The same request must always produce the same tag. Tags must be at
    /// least 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Failed` if no index key is configured.
    async fn derive_terms(&self, requests: &[TermRequest]) -> Result<Vec<Vec<u8>>, ProviderError>;
}

#[async_trait]
impl<P: CryptoProvider + ?Sized> CryptoProvider for std::sync::Arc<P> {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Sealed, ProviderError> {
        (**self).encrypt(plaintext, context).await
    }

    async fn decrypt(
        &self,
        request: DecryptRequest<'_>,
    ) -> Result<Zeroizing<Vec<u8>>, ProviderError> {
        (**self).decrypt(request).await
    }

    async fn decrypt_bulk(
        &self,
        requests: &[DecryptRequest<'_>],
    ) -> Result<Vec<Zeroizing<Vec<u8>>>, ProviderError> {
        (**self).decrypt_bulk(requests).await
    }

    async fn derive_terms(&self, requests: &[TermRequest]) -> Result<Vec<Vec<u8>>, ProviderError> {
        (**self).derive_terms(requests).await
    }
}
