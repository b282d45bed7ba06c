/*
 * Copyright 2019-2021 Wren Powell
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The public facade (component F): validates arguments and routes to the password-identity
//! layer's fast path or the rekey engine's scan path, exposing exactly the five operations from
//! spec.md §6. `VaultCoreBuilder` mirrors this corpus's `OpenOptions`/`RepoConfig` builder
//! pattern: chained setters over a plain value, then a single `build` call that wires the
//! concrete capabilities together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::crypto::{CryptoConfig, CryptoProvider};
use crate::identity::PasswordIdentityStore;
use crate::metadata::MetadataRepository;
use crate::record::{RecordQuery, RecordRepository};
use crate::rekey::{RekeyAborted, RekeyEngine, RekeyOutcome, DEFAULT_BATCH_SIZE, DEFAULT_MAX_IN_MEMORY, DEFAULT_PARALLEL_THRESHOLD, DEFAULT_WORKER_COUNT};
use crate::{Error, Result};

/// Configuration for a [`VaultCore`], built with chained setters and finalized with
/// [`VaultCoreBuilder::build`] — the options table from spec.md §6 expressed as a builder.
#[derive(Debug, Clone)]
pub struct VaultCoreBuilder {
    record_table: Option<String>,
    meta_table: Option<String>,
    password_identity_enabled: bool,
    crypto_config: CryptoConfig,
    parallel_threshold: i64,
    max_in_memory: i64,
    worker_count: usize,
    batch_size: usize,
}

impl Default for VaultCoreBuilder {
    fn default() -> Self {
        VaultCoreBuilder {
            record_table: None,
            meta_table: None,
            password_identity_enabled: false,
            crypto_config: CryptoConfig::default(),
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            max_in_memory: DEFAULT_MAX_IN_MEMORY,
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl VaultCoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `VaultTableName`: the record table name, required by [`VaultCoreBuilder::build_postgres`].
    pub fn record_table(mut self, table: impl Into<String>) -> Self {
        self.record_table = Some(table.into());
        self
    }

    /// `VaultMetaTableName`: required when password-identity mode is enabled.
    pub fn meta_table(mut self, table: impl Into<String>) -> Self {
        self.meta_table = Some(table.into());
        self
    }

    /// `PasswordIdentityEnabled`: gates the identity-driven fast path and on-read migration.
    pub fn password_identity(mut self, enabled: bool) -> Self {
        self.password_identity_enabled = enabled;
        self
    }

    /// `CryptoConfig`: cost parameters for the crypto primitive wrapper.
    pub fn crypto_config(mut self, config: CryptoConfig) -> Self {
        self.crypto_config = config;
        self
    }

    /// `ParallelThreshold`: sequential → parallel cutover (default 10,000).
    pub fn parallel_threshold(mut self, threshold: i64) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// `MaxInMemory`: in-memory → cursor cutover, also the cursor page size (default 1,000).
    pub fn max_in_memory(mut self, max: i64) -> Self {
        self.max_in_memory = max;
        self
    }

    /// `WorkerCount`: parallel pool width (default 10).
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// `BatchSize`: parallel batch size (default 100).
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Finalize the builder over caller-supplied capabilities.
    pub fn build(
        self,
        records: Arc<dyn RecordRepository>,
        meta: Arc<dyn MetadataRepository>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> VaultCore {
        let identity = if self.password_identity_enabled {
            Some(Arc::new(PasswordIdentityStore::new(
                meta.clone(),
                records.clone(),
                crypto.clone(),
            )))
        } else {
            None
        };

        let engine = RekeyEngine::new(
            records.clone(),
            meta.clone(),
            crypto.clone(),
            identity.clone(),
            self.parallel_threshold,
            self.max_in_memory,
            self.worker_count,
            self.batch_size,
        );

        VaultCore {
            records,
            engine,
            identity,
            max_in_memory: self.max_in_memory,
        }
    }

    /// Finalize the builder over a Postgres connection pool, constructing the record and
    /// metadata repositories from `record_table`/`meta_table`.
    #[cfg(feature = "store-postgres")]
    pub fn build_postgres(self, pool: sqlx::PgPool, crypto: Arc<dyn CryptoProvider>) -> Result<VaultCore> {
        let record_table = self
            .record_table
            .clone()
            .ok_or_else(|| Error::InvalidArgument("record_table is required".to_string()))?;
        if self.password_identity_enabled && self.meta_table.is_none() {
            return Err(Error::InvalidArgument(
                "meta_table is required when password_identity is enabled".to_string(),
            ));
        }
        let meta_table = self.meta_table.clone().unwrap_or_else(|| "vault_meta".to_string());

        let records: Arc<dyn RecordRepository> =
            Arc::new(crate::record::PostgresRecordRepository::new(pool.clone(), record_table));
        let meta: Arc<dyn MetadataRepository> =
            Arc::new(crate::metadata::PostgresMetadataRepository::new(pool, meta_table));
        Ok(self.build(records, meta, crypto))
    }
}

/// The in-process library surface over the rekey engine and the password-identity layer.
///
/// Construct with [`VaultCore::builder`]; there is no wire protocol or CLI (spec.md §6).
pub struct VaultCore {
    records: Arc<dyn RecordRepository>,
    engine: RekeyEngine,
    identity: Option<Arc<PasswordIdentityStore>>,
    max_in_memory: i64,
}

impl VaultCore {
    pub fn builder() -> VaultCoreBuilder {
        VaultCoreBuilder::new()
    }

    /// Re-encrypt every record decryptable by `old_password` under `new_password`.
    pub async fn bulk_rekey(
        &self,
        old_password: &[u8],
        new_password: &[u8],
    ) -> std::result::Result<RekeyOutcome, RekeyAborted> {
        self.bulk_rekey_cancellable(old_password, new_password, CancellationToken::new())
            .await
    }

    /// As [`VaultCore::bulk_rekey`], but cancellable via the supplied token.
    pub async fn bulk_rekey_cancellable(
        &self,
        old_password: &[u8],
        new_password: &[u8],
        cancel: CancellationToken,
    ) -> std::result::Result<RekeyOutcome, RekeyAborted> {
        self.engine.bulk_rekey(old_password, new_password, cancel).await
    }

    /// Alias for [`VaultCore::bulk_rekey`] (spec.md §4.E: the repository treats token records
    /// and generic records uniformly).
    pub async fn tokens_change_password(
        &self,
        old_password: &[u8],
        new_password: &[u8],
    ) -> std::result::Result<RekeyOutcome, RekeyAborted> {
        self.bulk_rekey(old_password, new_password).await
    }

    /// Scan every live record and link it to the identity for `password` where it isn't already
    /// linked and its value decrypts with `password`. Returns the count of records newly linked.
    pub async fn migrate_record_links(&self, password: &[u8]) -> Result<i64> {
        self.migrate_record_links_cancellable(password, CancellationToken::new()).await
    }

    /// As [`VaultCore::migrate_record_links`], but cancellable via the supplied token. Returns
    /// `Error::Cancelled` with the count already linked before cancellation was observed, the
    /// same partial-progress contract `bulk_rekey_cancellable` gives the rekey engine's
    /// `run_cursor` path.
    pub async fn migrate_record_links_cancellable(
        &self,
        password: &[u8],
        cancel: CancellationToken,
    ) -> Result<i64> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("password_identity mode is not enabled".to_string()))?;
        if password.is_empty() {
            return Err(Error::InvalidArgument("password must not be empty".to_string()));
        }

        let page_size = self.max_in_memory.max(1);
        let mut linked = 0i64;
        let mut offset = 0i64;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    committed: linked,
                    cause: "cancellation token was triggered".to_string(),
                });
            }
            let page = self
                .records
                .list(&RecordQuery::new().limit(page_size).offset(offset))
                .await?;
            let page_len = page.len();
            for record in &page {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled {
                        committed: linked,
                        cause: "cancellation token was triggered".to_string(),
                    });
                }
                if identity.migrate_record(&record.id, password).await? {
                    linked += 1;
                }
            }
            if (page_len as i64) < page_size {
                break;
            }
            offset += page_size;
        }
        Ok(linked)
    }

    /// Whether the vault schema/migration version has been recorded.
    pub async fn is_vault_migrated(&self) -> Result<bool> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("password_identity mode is not enabled".to_string()))?;
        identity.is_fully_migrated().await
    }

    /// Record the vault schema/migration version.
    pub async fn mark_vault_migrated(&self, version: &str) -> Result<()> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("password_identity mode is not enabled".to_string()))?;
        identity.mark_migrated(version).await
    }

    /// Read the vault schema/migration version, `NotFound` if never set.
    pub async fn get_vault_version(&self) -> Result<String> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("password_identity mode is not enabled".to_string()))?;
        identity.get_version().await
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::{CryptoConfig, CryptoProvider, SodiumCrypto};
    use crate::metadata::MemoryMetadataRepository;
    use crate::record::MemoryRecordRepository;

    use super::*;

    #[tokio::test]
    async fn bulk_rekey_through_the_facade_matches_the_engine() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SodiumCrypto::new(CryptoConfig::default()));
        let records = Arc::new(MemoryRecordRepository::new());
        records.seed_encrypted(crypto.as_ref(), b"secret", b"old").await;

        let vault = VaultCore::builder().build(records, Arc::new(MemoryMetadataRepository::new()), crypto);
        let outcome = vault.bulk_rekey(b"old", b"new").await.unwrap();
        assert_eq!(outcome.committed, 1);
    }

    #[tokio::test]
    async fn migrate_record_links_requires_identity_mode() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SodiumCrypto::new(CryptoConfig::default()));
        let vault = VaultCore::builder().build(
            Arc::new(MemoryRecordRepository::new()),
            Arc::new(MemoryMetadataRepository::new()),
            crypto,
        );
        assert!(vault.migrate_record_links(b"pw").await.is_err());
    }

    #[tokio::test]
    async fn migrate_record_links_cancelled_before_the_first_page_reports_zero_committed() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SodiumCrypto::new(CryptoConfig::default()));
        let records = Arc::new(MemoryRecordRepository::new());
        records.seed_encrypted(crypto.as_ref(), b"secret", b"pw").await;

        let vault = VaultCore::builder().password_identity(true).build(
            records,
            Arc::new(MemoryMetadataRepository::new()),
            crypto,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = vault.migrate_record_links_cancellable(b"pw", cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { committed: 0, .. }));
    }

    #[tokio::test]
    async fn vault_version_round_trips_through_mark_and_get() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SodiumCrypto::new(CryptoConfig::default()));
        let vault = VaultCore::builder().password_identity(true).build(
            Arc::new(MemoryRecordRepository::new()),
            Arc::new(MemoryMetadataRepository::new()),
            crypto,
        );
        assert!(!vault.is_vault_migrated().await.unwrap());
        vault.mark_vault_migrated("1.0.0").await.unwrap();
        assert!(vault.is_vault_migrated().await.unwrap());
        assert_eq!(vault.get_vault_version().await.unwrap(), "1.0.0");
    }
}
