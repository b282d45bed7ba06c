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
use sqlx::PgPool;

use crate::{Error, Result};

use super::MetadataRepository;

/// Metadata repository backed by a Postgres table with a unique index on
/// `(object_type, object_id, meta_key)`, per spec §6.
pub struct PostgresMetadataRepository {
    pool: PgPool,
    table: String,
}

impl PostgresMetadataRepository {
    /// `table` is the metadata table name recognized by the `VaultMetaTableName` option.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        PostgresMetadataRepository {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl MetadataRepository for PostgresMetadataRepository {
    async fn upsert(
        &self,
        object_type: &str,
        object_id: &str,
        meta_key: &str,
        meta_value: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (object_type, object_id, meta_key, meta_value, created_at, updated_at)
             VALUES ($1, $2, $3, $4, now(), now())
             ON CONFLICT (object_type, object_id, meta_key)
             DO UPDATE SET meta_value = EXCLUDED.meta_value, updated_at = now()",
            self.table
        );
        sqlx::query(&sql)
            .bind(object_type)
            .bind(object_id)
            .bind(meta_key)
            .bind(meta_value)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage("metadata upsert", e))?;
        Ok(())
    }

    async fn list_by_type(&self, object_type: &str, meta_key: &str) -> Result<Vec<(String, String)>> {
        let sql = format!(
            "SELECT object_id, meta_value FROM {} WHERE object_type = $1 AND meta_key = $2",
            self.table
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(object_type)
            .bind(meta_key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::storage("metadata list_by_type", e))?;
        Ok(rows)
    }

    async fn get(&self, object_type: &str, object_id: &str, meta_key: &str) -> Result<String> {
        let sql = format!(
            "SELECT meta_value FROM {} WHERE object_type = $1 AND object_id = $2 AND meta_key = $3",
            self.table
        );
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(object_type)
            .bind(object_id)
            .bind(meta_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::storage("metadata get", e))?;
        row.map(|(v,)| v).ok_or(Error::NotFound)
    }

    async fn delete_by_object(&self, object_type: &str, object_id: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE object_type = $1 AND object_id = $2",
            self.table
        );
        sqlx::query(&sql)
            .bind(object_type)
            .bind(object_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage("metadata delete_by_object", e))?;
        Ok(())
    }

    async fn list_record_ids_linked_to(&self, password_id: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT object_id FROM {} WHERE object_type = 'record' AND meta_key = 'password_id' AND meta_value = $1",
            self.table
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(password_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::storage("metadata list_record_ids_linked_to", e))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
