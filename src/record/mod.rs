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

//! The record repository (component B): the thin storage contract the rekey engine consumes.
//!
//! The SQL layer, migrations, driver selection, and connection pooling are out of scope for this
//! crate (see spec §1); [`RecordRepository`] is the capability boundary the engine depends on,
//! with one relational implementation (`store-postgres`) and one in-memory implementation for
//! tests and for embedders without a database.

mod memory;
#[cfg(feature = "store-postgres")]
mod postgres;
mod query;

pub use memory::MemoryRecordRepository;
#[cfg(feature = "store-postgres")]
pub use postgres::PostgresRecordRepository;
pub use query::{OrderColumn, RecordQuery};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Opaque unique identifier for a [`Record`], assigned on create and immutable.
pub type RecordId = String;

/// Opaque externally-visible handle for a [`Record`], unique across live and soft-deleted rows.
pub type Token = String;

/// The unit of stored secret.
///
/// `value` is always a well-formed ciphertext for *some* password: the repository never invents
/// records, and the core only ever reads or updates ones created by the token subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "store-postgres", derive(sqlx::FromRow))]
pub struct Record {
    pub id: RecordId,
    pub token: Token,
    /// Ciphertext produced by the crypto wrapper, rendered as bytes.
    pub value: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` means the record never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// `None` means the record is live; `Some` excludes it from default queries.
    pub soft_deleted_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Whether this record is excluded from default (non-soft-deleted) queries.
    pub fn is_soft_deleted(&self) -> bool {
        self.soft_deleted_at.is_some()
    }
}

/// The storage contract the rekey engine and facade consume.
///
/// `list` must honor total ordering by the chosen column plus a tiebreaker on `id`, so that
/// cursor paging by `(limit, offset)` is stable across calls with no intervening writes.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn count(&self, query: &RecordQuery) -> Result<i64>;

    async fn list(&self, query: &RecordQuery) -> Result<Vec<Record>>;

    async fn find(&self, id: &str) -> Result<Record>;

    async fn find_by_token(&self, token: &str) -> Result<Record>;

    /// Persist the mutable fields of `record`. Implementations MUST refuse to change `id` or
    /// `token` relative to the currently stored row.
    async fn update(&self, record: &Record) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn soft_delete(&self, id: &str) -> Result<()>;
}
