/*
 * Copyright 2019-2020 Wren Powell
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
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Error, Result};

use super::query::OrderColumn;
use super::{Record, RecordQuery, RecordRepository};

/// An in-memory [`RecordRepository`], used in the crate's own test suite and available to
/// embedders that don't need a database.
#[derive(Debug, Default)]
pub struct MemoryRecordRepository {
    records: RwLock<Vec<Record>>,
}

impl MemoryRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing the token subsystem. Test-only helper: the real
    /// repository never invents records (spec §3 lifecycle).
    pub async fn seed(&self, record: Record) {
        self.records.write().await.push(record);
    }

    /// Build and seed a record encrypted with `password`, for test fixtures.
    pub async fn seed_encrypted(
        &self,
        crypto: &dyn crate::crypto::CryptoProvider,
        plaintext: &[u8],
        password: &[u8],
    ) -> Record {
        let now = Utc::now();
        let record = Record {
            id: Uuid::new_v4().to_string(),
            token: Uuid::new_v4().to_string(),
            value: crypto.encode(plaintext, password),
            created_at: now,
            updated_at: now,
            expires_at: None,
            soft_deleted_at: None,
        };
        self.seed(record.clone()).await;
        record
    }
}

fn matches(query: &RecordQuery, record: &Record) -> bool {
    query.include_soft_deleted || !record.is_soft_deleted()
}

/// Blank out any column `query` didn't project, mirroring the placeholder columns the Postgres
/// implementation selects in their place.
fn project(query: &RecordQuery, mut record: Record) -> Record {
    if !query.selects("value") {
        record.value = Vec::new();
    }
    if !query.selects("created_at") {
        record.created_at = chrono::DateTime::UNIX_EPOCH;
    }
    if !query.selects("updated_at") {
        record.updated_at = chrono::DateTime::UNIX_EPOCH;
    }
    if !query.selects("expires_at") {
        record.expires_at = None;
    }
    if !query.selects("soft_deleted_at") {
        record.soft_deleted_at = None;
    }
    record
}

fn sorted_matching(query: &RecordQuery, records: &[Record]) -> Vec<Record> {
    let mut matching: Vec<Record> = records
        .iter()
        .filter(|r| matches(query, r))
        .cloned()
        .collect();
    matching.sort_by(|a, b| {
        let primary = match query.order_by {
            OrderColumn::CreatedAt => a.created_at.cmp(&b.created_at),
            OrderColumn::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        // Tiebreak on `id` so paging stays stable across calls with no intervening writes.
        primary.then_with(|| a.id.cmp(&b.id))
    });
    matching
}

#[async_trait]
impl RecordRepository for MemoryRecordRepository {
    async fn count(&self, query: &RecordQuery) -> Result<i64> {
        query.validate()?;
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| matches(query, r)).count() as i64)
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        query.validate()?;
        let records = self.records.read().await;
        let matching = sorted_matching(query, &records);

        let start = query.offset.max(0) as usize;
        if start >= matching.len() {
            return Ok(Vec::new());
        }
        let end = match query.limit {
            Some(limit) => (start + limit.max(0) as usize).min(matching.len()),
            None => matching.len(),
        };
        Ok(matching[start..end]
            .iter()
            .cloned()
            .map(|r| project(query, r))
            .collect())
    }

    async fn find(&self, id: &str) -> Result<Record> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn find_by_token(&self, token: &str) -> Result<Record> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| r.token == token)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn update(&self, record: &Record) -> Result<()> {
        let mut records = self.records.write().await;
        let existing = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(Error::NotFound)?;

        if existing.token != record.token {
            return Err(Error::InvalidArgument(
                "update must not change a record's token".to_string(),
            ));
        }

        existing.value = record.value.clone();
        existing.expires_at = record.expires_at;
        existing.soft_deleted_at = record.soft_deleted_at;
        existing.updated_at = Utc::now().max(existing.updated_at);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.iter_mut().find(|r| r.id == id).ok_or(Error::NotFound)?;
        record.soft_deleted_at = Some(Utc::now());
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoConfig, SodiumCrypto};

    #[tokio::test]
    async fn list_orders_by_created_at_then_id() {
        let repo = MemoryRecordRepository::new();
        let crypto = SodiumCrypto::new(CryptoConfig::default());
        for _ in 0..3 {
            repo.seed_encrypted(&crypto, b"v", b"p").await;
        }
        let query = RecordQuery::new();
        let listed = repo.list(&query).await.unwrap();
        assert_eq!(listed.len(), 3);
        for window in listed.windows(2) {
            assert!(
                window[0].created_at < window[1].created_at
                    || (window[0].created_at == window[1].created_at && window[0].id < window[1].id)
            );
        }
    }

    #[tokio::test]
    async fn update_rejects_token_change() {
        let repo = MemoryRecordRepository::new();
        let crypto = SodiumCrypto::new(CryptoConfig::default());
        let mut record = repo.seed_encrypted(&crypto, b"v", b"p").await;
        record.token = "a-different-token".to_string();
        assert!(repo.update(&record).await.is_err());
    }

    #[tokio::test]
    async fn negative_limit_is_invalid_argument() {
        let repo = MemoryRecordRepository::new();
        let query = RecordQuery::new().limit(-1);
        assert!(matches!(repo.count(&query).await, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn projection_blanks_unselected_columns_but_keeps_id_and_token() {
        let repo = MemoryRecordRepository::new();
        let crypto = SodiumCrypto::new(CryptoConfig::default());
        let seeded = repo.seed_encrypted(&crypto, b"v", b"p").await;

        let query = RecordQuery::new().columns(vec!["token".to_string()]);
        let listed = repo.list(&query).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, seeded.id);
        assert_eq!(listed[0].token, seeded.token);
        assert!(listed[0].value.is_empty());
        assert_eq!(listed[0].created_at, chrono::DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn unknown_projected_column_is_invalid_argument() {
        let repo = MemoryRecordRepository::new();
        let query = RecordQuery::new().columns(vec!["bogus".to_string()]);
        assert!(matches!(repo.list(&query).await, Err(Error::InvalidArgument(_))));
    }
}
