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

//! The metadata repository (component C): an object-typed key/value side table used by the
//! password-identity layer to group records by password identity without ever storing a
//! reversible secret.

mod memory;
#[cfg(feature = "store-postgres")]
mod postgres;

pub use memory::MemoryMetadataRepository;
#[cfg(feature = "store-postgres")]
pub use postgres::PostgresMetadataRepository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One row of the object-typed side table; `(object_type, object_id, meta_key)` is its logical
/// primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "store-postgres", derive(sqlx::FromRow))]
pub struct MetaRow {
    pub object_type: String,
    pub object_id: String,
    pub meta_key: String,
    pub meta_value: String,
}

/// The storage contract the password-identity layer consumes.
///
/// `upsert` and `list_by_type` must be safe under concurrent writers: last-writer-wins on
/// identical `(object_type, object_id, meta_key)` keys.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    async fn upsert(
        &self,
        object_type: &str,
        object_id: &str,
        meta_key: &str,
        meta_value: &str,
    ) -> Result<()>;

    async fn list_by_type(&self, object_type: &str, meta_key: &str) -> Result<Vec<(String, String)>>;

    async fn get(&self, object_type: &str, object_id: &str, meta_key: &str) -> Result<String>;

    async fn delete_by_object(&self, object_type: &str, object_id: &str) -> Result<()>;

    async fn list_record_ids_linked_to(&self, password_id: &str) -> Result<Vec<String>>;
}
