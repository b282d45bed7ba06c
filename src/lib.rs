#![cfg_attr(docsrs, feature(doc_cfg))]

//! `vaultcore` is a library for rekeying a large token-addressed store of encrypted values under
//! a new password without ever holding the whole dataset in memory at once.
//!
//! A *record* is a ciphertext addressed by an opaque *token*; the store never sees plaintext
//! except during a rekey, and never persists a password or a key derived from one — only short
//! opaque *verifiers* used to recognize a password it has seen before (see [`crate::identity`]).
//!
//! The centerpiece is [`crate::rekey::RekeyEngine`], which re-encrypts every record under a new
//! password using one of three strategies chosen by dataset size: sequential, a bounded worker
//! pool, or cursor-paged batches. [`crate::VaultCore`] is the façade most embedders should use;
//! [`crate::record`], [`crate::metadata`], and [`crate::identity`] are the storage and
//! bookkeeping layers it is built from.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use vaultcore::crypto::SodiumCrypto;
//! use vaultcore::metadata::MemoryMetadataRepository;
//! use vaultcore::record::{MemoryRecordRepository, RecordRepository};
//! use vaultcore::VaultCore;
//!
//! # async fn run() {
//! let crypto = Arc::new(SodiumCrypto::default());
//! let records = Arc::new(MemoryRecordRepository::new());
//! records.seed_encrypted(&*crypto, b"secret value", b"old password").await;
//!
//! let vault = VaultCore::builder().build(records, Arc::new(MemoryMetadataRepository::new()), crypto);
//! let outcome = vault.bulk_rekey(b"old password", b"new password").await.unwrap();
//! assert_eq!(outcome.committed, 1);
//! # }
//! ```
//!
//! # Features
//!
//! Feature           | Description
//! ---               | ---
//! `store-postgres`  | Use [`crate::record::PostgresRecordRepository`] and [`crate::metadata::PostgresMetadataRepository`]

#![forbid(unsafe_code)]

pub use anyhow;
pub use uuid;

pub use error::{Error, Result};
pub use facade::{VaultCore, VaultCoreBuilder};

mod error;
mod facade;

pub mod crypto;
pub mod identity;
pub mod metadata;
pub mod record;
pub mod rekey;
