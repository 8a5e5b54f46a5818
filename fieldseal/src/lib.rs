//! # `fieldseal`
//!
//! Searchable field-level encryption for application records.
//!
//! ## Features
//!
//! - Randomized authenticated encryption of individual columns
//! - Equality search through keyed blind indexes
//! - Case-insensitive pattern search through n-gram bloom filters
//! - Record-level orchestration with bulk decryption and per-item results
//! - Structured predicates that render to parameterized SQL
//!
//! The actual cryptography is delegated to a [`CryptoProvider`]; the
//! `fieldseal-local` crate ships an in-process one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldseal::prelude::*;
//! use fieldseal_local::LocalProvider;
//!
//! let schema = Schema::new().table(
//!     TablePolicy::new("users")
//!         .column(ColumnPolicy::new("users", "email").equality().free_text_search()),
//! );
//! let codec = Codec::new(LocalProvider::open("./keys")?, Limits::default());
//! let client = Client::new(Orchestrator::new(codec, schema), MemoryStore::new());
//!
//! client.insert("users", Record::new(1).with("email", "alice@example.com")).await?;
//! let filters = [Filter::like("email", "%@example.%")];
//! let found = client.search("users", &filters, Combine::Any).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod kdf;
pub mod orchestrator;
pub mod payload;
pub mod policy;
pub mod predicate;
pub mod provider;
pub mod record;
pub mod storage;
pub mod store;
pub mod terms;
pub mod value;

#[cfg(test)]
mod testing;

pub use provider::CryptoProvider;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::batch::BatchResult;
    pub use crate::client::{Client, Combine, Filter, FilterOp};
    pub use crate::codec::Codec;
    pub use crate::config::{Config, Limits};
    pub use crate::context::{EncryptionContext, IndexContext, IndexKind};
    pub use crate::error::{Error, ProviderError};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::payload::CiphertextPayload;
    pub use crate::policy::{Capability, ColumnPolicy, MatchOptions, Schema, TablePolicy};
    pub use crate::predicate::Predicate;
    pub use crate::provider::{CryptoProvider, DecryptRequest, Sealed, TermRequest};
    pub use crate::record::{Field, Model, Record};
    pub use crate::storage::{from_storage_form, to_storage_form, StorageRow};
    pub use crate::store::{MemoryStore, Store};
    pub use crate::terms::{ReturnForm, SearchTerm, TermGenerator, TermQuery};
    pub use crate::value::{FieldValue, PlaintextValue};
}
