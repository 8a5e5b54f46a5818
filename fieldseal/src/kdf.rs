//! Key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! Providers derive one sealing key per column and one tagging key per index
//! from their root keys, so no two columns or index kinds share key material.

use crate::context::{EncryptionContext, IndexContext};
use crate::error::ProviderError;
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

/// Standard derived key size in bytes (256 bits).
pub const DEK_SIZE: usize = 32;

/// Salt separating sealing keys from index keys derived from the same root.
const DEK_SALT: &[u8] = b"fieldseal.dek";
const INDEX_SALT: &[u8] = b"fieldseal.index";

/// Derives a Data Encryption Key (DEK) for a column from a root key.
///
/// The context string `table|column|vN` is the HKDF `info` parameter.
///
/// # Errors
///
/// Returns `ProviderError::Failed` if the derivation fails.
///
/// # Example
///
/// ```
/// use fieldseal::kdf::derive_dek;
/// use fieldseal::context::EncryptionContext;
/// use secrecy::SecretVec;
///
/// let root = SecretVec::new(vec![0u8; 32]);
/// let context = EncryptionContext::new("users", "email");
/// let dek = derive_dek(&root, &context).expect("DEK derivation failed");
/// ```
pub fn derive_dek(
    root: &SecretVec<u8>,
    context: &EncryptionContext,
) -> Result<SecretVec<u8>, ProviderError> {
    expand(root, DEK_SALT, context.to_string().as_bytes())
}

/// Derives the HMAC key for one index of one column.
///
/// # Errors
///
/// Returns `ProviderError::Failed` if the derivation fails.
pub fn derive_index_key(
    root: &SecretVec<u8>,
    context: &IndexContext,
) -> Result<SecretVec<u8>, ProviderError> {
    expand(root, INDEX_SALT, context.to_string().as_bytes())
}

fn expand(root: &SecretVec<u8>, salt: &[u8], info: &[u8]) -> Result<SecretVec<u8>, ProviderError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), root.expose_secret());

    let mut key = vec![0u8; DEK_SIZE];
    hkdf.expand(info, &mut key)
        .map_err(|e| ProviderError::Failed(format!("key derivation failed: {e}")))?;

    Ok(SecretVec::new(key))
}
