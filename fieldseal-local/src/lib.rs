//! In-process crypto provider for `fieldseal`.
//!
//! Keys live in a directory and never leave the process. This provider is
//! suitable for development, tests and single-node deployments.

#![warn(clippy::pedantic, clippy::nursery)]

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use fieldseal::context::EncryptionContext;
use fieldseal::error::ProviderError;
use fieldseal::kdf::{derive_dek, derive_index_key, DEK_SIZE};
use fieldseal::provider::{CryptoProvider, DecryptRequest, Sealed, TermRequest};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
const TAG_SIZE: usize = 16;

/// Root key for sealing.
pub const DATA_KEY_FILE: &str = "data.key";

/// Root key for search tags.
pub const INDEX_KEY_FILE: &str = "index.key";

/// Provider holding two root keys in memory.
///
/// Key directory layout:
/// ```text
/// keys/
/// ├── data.key   (32 bytes, 0600 permissions)
/// └── index.key  (32 bytes, 0600 permissions)
/// ```
///
/// Per-column keys are derived with HKDF, so the root keys are never used
/// directly.
pub struct LocalProvider {
    key_id: String,
    data_key: SecretVec<u8>,
    index_key: SecretVec<u8>,
}

impl LocalProvider {
    /// Builds a provider from raw root keys.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Failed` if a key is not 32 bytes.
    pub fn from_keys(
        data_key: SecretVec<u8>,
        index_key: SecretVec<u8>,
    ) -> Result<Self, ProviderError> {
        for (name, key) in [("data", &data_key), ("index", &index_key)] {
            let len = key.expose_secret().len();
            if len != DEK_SIZE {
                return Err(ProviderError::Failed(format!(
                    "{name} key must be {DEK_SIZE} bytes, got {len}"
                )));
            }
        }
        Ok(Self { key_id: key_id(&data_key), data_key, index_key })
    }

    /// Builds a provider with fresh random keys that are never persisted.
    #[must_use]
    pub fn generate() -> Self {
        let data_key = random_key();
        let index_key = random_key();
        Self { key_id: key_id(&data_key), data_key, index_key }
    }

    /// Creates a key directory with fresh root keys.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Failed` if the directory already holds keys and
    /// `ProviderError::Io` if writing fails.
    pub fn init(dir: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for file in [DATA_KEY_FILE, INDEX_KEY_FILE] {
            if dir.join(file).exists() {
                return Err(ProviderError::Failed(format!(
                    "key directory already initialized: {}",
                    dir.display()
                )));
            }
        }

        let provider = Self::generate();
        write_key(&dir.join(DATA_KEY_FILE), &provider.data_key)?;
        write_key(&dir.join(INDEX_KEY_FILE), &provider.index_key)?;
        debug!(dir = %dir.display(), key_id = %provider.key_id, "key directory initialized");
        Ok(provider)
    }

    /// Loads root keys from a key directory.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Io` if a key file cannot be read and
    /// `ProviderError::Failed` if a key has the wrong size.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let dir = dir.as_ref();
        let data_key = read_key(&dir.join(DATA_KEY_FILE))?;
        let index_key = read_key(&dir.join(INDEX_KEY_FILE))?;
        Self::from_keys(data_key, index_key)
    }

    /// Identifier recorded in every payload this provider seals.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn cipher(&self, context: &EncryptionContext) -> Result<ChaCha20Poly1305, ProviderError> {
        let dek = derive_dek(&self.data_key, context)?;
        ChaCha20Poly1305::new_from_slice(dek.expose_secret())
            .map_err(|e| ProviderError::Failed(format!("invalid derived key: {e}")))
    }

    fn open_sealed(
        &self,
        request: DecryptRequest<'_>,
    ) -> Result<Zeroizing<Vec<u8>>, ProviderError> {
        if request.key_id != self.key_id {
            return Err(ProviderError::KeyNotFound(request.key_id.to_string()));
        }
        if request.ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ProviderError::Rejected);
        }

        let (nonce, body) = request.ciphertext.split_at(NONCE_SIZE);
        let aad = request.context.to_string();
        let plaintext = self
            .cipher(request.context)?
            .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad: aad.as_bytes() })
            .map_err(|_| ProviderError::Rejected)?;
        Ok(Zeroizing::new(plaintext))
    }
}

impl fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProvider").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

#[async_trait]
impl CryptoProvider for LocalProvider {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> Result<Sealed, ProviderError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let aad = context.to_string();
        let body = self
            .cipher(context)?
            .encrypt(&nonce, Payload { msg: plaintext, aad: aad.as_bytes() })
            .map_err(|e| {
                ProviderError::Failed(format!("ChaCha20-Poly1305 encryption failed: {e}"))
            })?;

        let mut ciphertext = Vec::with_capacity(NONCE_SIZE + body.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&body);
        Ok(Sealed { key_id: self.key_id.clone(), ciphertext })
    }

    async fn decrypt(
        &self,
        request: DecryptRequest<'_>,
    ) -> Result<Zeroizing<Vec<u8>>, ProviderError> {
        self.open_sealed(request)
    }

    async fn decrypt_bulk(
        &self,
        requests: &[DecryptRequest<'_>],
    ) -> Result<Vec<Zeroizing<Vec<u8>>>, ProviderError> {
        requests.iter().map(|r| self.open_sealed(*r)).collect()
    }

    async fn derive_terms(&self, requests: &[TermRequest]) -> Result<Vec<Vec<u8>>, ProviderError> {
        requests
            .iter()
            .map(|request| {
                let key = derive_index_key(&self.index_key, &request.context)?;
                let mut mac = <HmacSha256 as Mac>::new_from_slice(key.expose_secret())
                    .map_err(|e| ProviderError::Failed(format!("invalid index key: {e}")))?;
                mac.update(&request.input);
                Ok(mac.finalize().into_bytes().to_vec())
            })
            .collect()
    }
}

fn random_key() -> SecretVec<u8> {
    let mut key = vec![0u8; DEK_SIZE];
    OsRng.fill_bytes(&mut key);
    SecretVec::new(key)
}

fn key_id(data_key: &SecretVec<u8>) -> String {
    let digest = Sha256::digest(data_key.expose_secret());
    format!("local-{}", hex::encode(&digest[..8]))
}

fn write_key(path: &Path, key: &SecretVec<u8>) -> Result<(), ProviderError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key.expose_secret())?;
    file.sync_all()?;
    Ok(())
}

fn read_key(path: &Path) -> Result<SecretVec<u8>, ProviderError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format_args!("{:o}", mode & 0o777),
                "key file is readable by other users"
            );
        }
    }
    Ok(SecretVec::new(fs::read(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldseal::context::{IndexContext, IndexKind};
    use tempfile::TempDir;

    fn context() -> EncryptionContext {
        EncryptionContext::new("users", "email")
    }

    #[tokio::test]
    async fn test_seal_and_open() {
        let provider = LocalProvider::generate();
        let ctx = context();

        let sealed = provider.encrypt(b"alice@example.com", &ctx).await.unwrap();
        assert_eq!(sealed.key_id, provider.key_id());
        assert_eq!(sealed.ciphertext.len(), NONCE_SIZE + 17 + TAG_SIZE);

        let request = DecryptRequest {
            key_id: &sealed.key_id,
            ciphertext: &sealed.ciphertext,
            context: &ctx,
        };
        let opened = provider.decrypt(request).await.unwrap();
        assert_eq!(opened.as_slice(), b"alice@example.com");
    }

    #[tokio::test]
    async fn test_context_is_authenticated() {
        let provider = LocalProvider::generate();
        let sealed = provider.encrypt(b"alice", &context()).await.unwrap();

        let other = EncryptionContext::new("users", "name");
        let request = DecryptRequest {
            key_id: &sealed.key_id,
            ciphertext: &sealed.ciphertext,
            context: &other,
        };
        assert!(matches!(provider.decrypt(request).await, Err(ProviderError::Rejected)));
    }

    #[tokio::test]
    async fn test_tamper_and_unknown_key() {
        let provider = LocalProvider::generate();
        let ctx = context();
        let mut sealed = provider.encrypt(b"alice", &ctx).await.unwrap();

        let request = DecryptRequest {
            key_id: "local-0000",
            ciphertext: &sealed.ciphertext,
            context: &ctx,
        };
        assert!(matches!(provider.decrypt(request).await, Err(ProviderError::KeyNotFound(_))));

        sealed.ciphertext[NONCE_SIZE] ^= 0x01;
        let request = DecryptRequest {
            key_id: &sealed.key_id,
            ciphertext: &sealed.ciphertext,
            context: &ctx,
        };
        assert!(matches!(provider.decrypt(request).await, Err(ProviderError::Rejected)));

        let request = DecryptRequest {
            key_id: &sealed.key_id,
            ciphertext: &[0u8; 4],
            context: &ctx,
        };
        assert!(matches!(provider.decrypt(request).await, Err(ProviderError::Rejected)));
    }

    #[tokio::test]
    async fn test_terms_domain_separated() {
        let provider = LocalProvider::generate();
        let request = |kind| TermRequest {
            context: IndexContext::new("users", "email", kind),
            input: Zeroizing::new(b"ali".to_vec()),
        };

        let requests =
            [request(IndexKind::Unique), request(IndexKind::Match), request(IndexKind::Unique)];
        let tags = provider.derive_terms(&requests).await.unwrap();
        assert_eq!(tags[0].len(), 32);
        assert_eq!(tags[0], tags[2]);
        assert_ne!(tags[0], tags[1]);
    }

    #[tokio::test]
    async fn test_init_and_open() {
        let dir = TempDir::new().unwrap();
        let created = LocalProvider::init(dir.path()).unwrap();
        let opened = LocalProvider::open(dir.path()).unwrap();
        assert_eq!(created.key_id(), opened.key_id());

        let ctx = context();
        let sealed = created.encrypt(b"persisted", &ctx).await.unwrap();
        let request = DecryptRequest {
            key_id: &sealed.key_id,
            ciphertext: &sealed.ciphertext,
            context: &ctx,
        };
        assert_eq!(opened.decrypt(request).await.unwrap().as_slice(), b"persisted");

        assert!(matches!(LocalProvider::init(dir.path()), Err(ProviderError::Failed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        LocalProvider::init(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(DATA_KEY_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_open_missing_or_short_keys() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(LocalProvider::open(dir.path()), Err(ProviderError::Io(_))));

        fs::write(dir.path().join(DATA_KEY_FILE), [1u8; 8]).unwrap();
        fs::write(dir.path().join(INDEX_KEY_FILE), [2u8; 32]).unwrap();
        assert!(matches!(LocalProvider::open(dir.path()), Err(ProviderError::Failed(_))));
    }

    #[test]
    fn test_key_id_stable() {
        let make = || {
            LocalProvider::from_keys(SecretVec::new(vec![7u8; 32]), SecretVec::new(vec![8u8; 32]))
                .unwrap()
        };
        assert_eq!(make().key_id(), make().key_id());
        assert!(make().key_id().starts_with("local-"));
        assert_eq!(make().key_id().len(), "local-".len() + 16);
    }
}
