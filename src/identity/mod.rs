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

//! The password-identity layer (component D): resolves a password to an identity id via
//! try-and-verify over stored verifiers, so the rekey engine (component E) can narrow its
//! working set to "records linked to this identity" instead of scanning the whole table.
//!
//! Identity lookup is intentionally O(N) in the number of *distinct passwords*, not in the
//! number of records — this design targets stores with at most a few hundred distinct passwords
//! (spec §4.D). A short-TTL verifier cache keeps repeated lookups cheap within that bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::{CryptoProvider, Verifier};
use crate::metadata::MetadataRepository;
use crate::record::RecordRepository;
use crate::{Error, Result};

const OBJECT_TYPE_IDENTITY: &str = "password_identity";
const OBJECT_TYPE_RECORD: &str = "record";
const OBJECT_TYPE_VAULT: &str = "vault";
const KEY_HASH: &str = "hash";
const KEY_PASSWORD_ID: &str = "password_id";
const VAULT_SETTINGS_ID: &str = "settings";
const KEY_VERSION: &str = "version";

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// The id of a `password_identity` row: `p_<uuid>`, per spec §3.
pub type IdentityId = String;

/// Groups records by the password used to encrypt them, without ever storing a reversible
/// secret — only a password verifier (see [`crate::crypto::Verifier`]).
pub struct PasswordIdentityStore {
    meta: Arc<dyn MetadataRepository>,
    records: Arc<dyn RecordRepository>,
    crypto: Arc<dyn CryptoProvider>,
    cache: RwLock<HashMap<IdentityId, (Verifier, Instant)>>,
    cache_ttl: Duration,
    /// Serializes the find-then-create sequence in `ensure_identity` so two concurrent callers
    /// presenting the same new password can't both decide "not found" and create two distinct
    /// identities that both verify it.
    creation_lock: Mutex<()>,
}

impl PasswordIdentityStore {
    pub fn new(
        meta: Arc<dyn MetadataRepository>,
        records: Arc<dyn RecordRepository>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        PasswordIdentityStore {
            meta,
            records,
            crypto,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
            creation_lock: Mutex::new(()),
        }
    }

    /// Override the verifier cache TTL (default 30s).
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    async fn all_verifiers(&self) -> Result<Vec<(IdentityId, Verifier)>> {
        let now = Instant::now();
        {
            let cache = self.cache.read().await;
            if !cache.is_empty() && cache.values().all(|(_, stamped)| now.duration_since(*stamped) < self.cache_ttl) {
                return Ok(cache.iter().map(|(id, (v, _))| (id.clone(), v.clone())).collect());
            }
        }

        let rows = self.meta.list_by_type(OBJECT_TYPE_IDENTITY, KEY_HASH).await?;
        debug!(candidates = rows.len(), "scanning password identities");

        let mut fresh = HashMap::new();
        let mut out = Vec::with_capacity(rows.len());
        for (object_id, meta_value) in rows {
            if let Some(verifier) = Verifier::parse(&meta_value) {
                fresh.insert(object_id.clone(), (verifier.clone(), now));
                out.push((object_id, verifier));
            } else {
                warn!(identity = %object_id, "malformed password verifier, skipping");
            }
        }

        *self.cache.write().await = fresh;
        Ok(out)
    }

    fn invalidate_cache_sync(cache: &mut HashMap<IdentityId, (Verifier, Instant)>) {
        cache.clear();
    }

    /// Scan all `password_identity` verifiers and return the id of the first whose verifier
    /// validates `password`. Ordering is unspecified but deterministic per call.
    pub async fn find_identity(&self, password: &[u8]) -> Result<Option<IdentityId>> {
        let verifiers = self.all_verifiers().await?;
        let crypto = Arc::clone(&self.crypto);
        let password = password.to_vec();
        tokio::task::spawn_blocking(move || {
            verifiers
                .into_iter()
                .find(|(_, verifier)| crypto.verify(&password, verifier))
                .map(|(id, _)| id)
        })
        .await
        .map_err(|_| Error::Internal("password verification task panicked".to_string()))
    }

    /// Return an existing identity for `password`, or create a new one.
    pub async fn ensure_identity(&self, password: &[u8]) -> Result<IdentityId> {
        let _guard = self.creation_lock.lock().await;

        // Re-check under the lock: another caller may have just created this identity.
        if let Some(id) = self.find_identity(password).await? {
            return Ok(id);
        }

        let crypto = Arc::clone(&self.crypto);
        let password_owned = password.to_vec();
        let verifier = tokio::task::spawn_blocking(move || crypto.hash(&password_owned))
            .await
            .map_err(|_| Error::Internal("password hashing task panicked".to_string()))?;
        let id = format!("p_{}", Uuid::new_v4());
        self.meta
            .upsert(OBJECT_TYPE_IDENTITY, &id, KEY_HASH, verifier.as_str())
            .await?;

        self.cache.write().await.insert(id.clone(), (verifier, Instant::now()));
        Ok(id)
    }

    /// Link a record to a password identity, replacing any existing link.
    pub async fn link_record(&self, record_id: &str, identity_id: &str) -> Result<()> {
        self.meta
            .upsert(OBJECT_TYPE_RECORD, record_id, KEY_PASSWORD_ID, identity_id)
            .await
    }

    /// Remove a record's link, used when the record is hard-deleted.
    pub async fn unlink_record(&self, record_id: &str) -> Result<()> {
        self.meta.delete_by_object(OBJECT_TYPE_RECORD, record_id).await
    }

    /// All record ids currently linked to `identity_id`.
    pub async fn records_for_identity(&self, identity_id: &str) -> Result<Vec<String>> {
        self.meta.list_record_ids_linked_to(identity_id).await
    }

    /// If `record_id` has no link yet and its value decodes with `password`, link it to
    /// (creating if needed) the identity for `password`. Otherwise a no-op. Idempotent: calling
    /// this twice with the same password yields the same link.
    pub async fn migrate_record(&self, record_id: &str, password: &[u8]) -> Result<bool> {
        if self
            .meta
            .get(OBJECT_TYPE_RECORD, record_id, KEY_PASSWORD_ID)
            .await
            .is_ok()
        {
            return Ok(false);
        }

        let record = self.records.find(record_id).await?;
        if record.value.is_empty() {
            return Ok(false);
        }

        let crypto = Arc::clone(&self.crypto);
        let ciphertext = record.value.clone();
        let password_owned = password.to_vec();
        let decodes = tokio::task::spawn_blocking(move || crypto.decode(&ciphertext, &password_owned).is_ok())
            .await
            .map_err(|_| Error::Internal("password decode task panicked".to_string()))?;
        if !decodes {
            return Ok(false);
        }

        let identity_id = self.ensure_identity(password).await?;
        self.link_record(record_id, &identity_id).await?;
        Ok(true)
    }

    /// Whether the `vault/settings/version` row has been written.
    pub async fn is_fully_migrated(&self) -> Result<bool> {
        match self.meta.get(OBJECT_TYPE_VAULT, VAULT_SETTINGS_ID, KEY_VERSION).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Record a vault schema/migration version.
    pub async fn mark_migrated(&self, version: &str) -> Result<()> {
        self.meta
            .upsert(OBJECT_TYPE_VAULT, VAULT_SETTINGS_ID, KEY_VERSION, version)
            .await?;
        // The version row changed identity semantics for nothing, but clearing keeps the
        // verifier cache honest if a caller mixes `mark_migrated` with concurrent rekeys.
        let mut cache = self.cache.write().await;
        Self::invalidate_cache_sync(&mut cache);
        drop(cache);
        Ok(())
    }

    /// Read the vault schema/migration version, `NotFound` if never set.
    pub async fn get_version(&self) -> Result<String> {
        self.meta.get(OBJECT_TYPE_VAULT, VAULT_SETTINGS_ID, KEY_VERSION).await
    }
}
