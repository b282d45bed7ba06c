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

//! A stateless, `sqlx`-backed [`RecordRepository`] over a Postgres table, following the
//! hand-written-SQL shape used throughout this corpus for CRUD stores: a stateless struct whose
//! methods take a `&PgPool`, with explicit `RETURNING` clauses and typed errors.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{Error, Result};

use super::query::OrderColumn;
use super::{Record, RecordQuery, RecordRepository};

/// Record repository backed by a Postgres table with the seven columns from spec §3.
pub struct PostgresRecordRepository {
    pool: PgPool,
    table: String,
}

impl PostgresRecordRepository {
    /// `table` is the record table name recognized by the `VaultTableName` configuration option.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        PostgresRecordRepository {
            pool,
            table: table.into(),
        }
    }

    fn order_column(column: OrderColumn) -> &'static str {
        match column {
            OrderColumn::CreatedAt => "created_at",
            OrderColumn::UpdatedAt => "updated_at",
        }
    }

    /// The `SELECT` list for `query`'s projection: a real column reference for every name
    /// `query` selects, and a cheap typed placeholder literal for every name it doesn't, so the
    /// result always has all seven columns `Record`'s `FromRow` derive expects.
    fn select_list(query: &RecordQuery) -> String {
        let expr = |column: &str, real: &str, placeholder: &str| -> String {
            if query.selects(column) {
                format!("{real} AS {column}")
            } else {
                format!("{placeholder} AS {column}")
            }
        };
        [
            expr("id", "id", "id"),
            expr("token", "token", "token"),
            expr("value", "value", "'\\x'::bytea"),
            expr("created_at", "created_at", "'epoch'::timestamptz"),
            expr("updated_at", "updated_at", "'epoch'::timestamptz"),
            expr("expires_at", "expires_at", "NULL::timestamptz"),
            expr("soft_deleted_at", "soft_deleted_at", "NULL::timestamptz"),
        ]
        .join(", ")
    }
}

#[async_trait]
impl RecordRepository for PostgresRecordRepository {
    async fn count(&self, query: &RecordQuery) -> Result<i64> {
        query.validate()?;
        let sql = format!(
            "SELECT count(*) FROM {} WHERE ($1 OR soft_deleted_at IS NULL)",
            self.table
        );
        let count: (i64,) = sqlx::query_as(&sql)
            .bind(query.include_soft_deleted)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::storage("record count", e))?;
        Ok(count.0)
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        query.validate()?;
        let sql = format!(
            "SELECT {}
             FROM {}
             WHERE ($1 OR soft_deleted_at IS NULL)
             ORDER BY {} ASC, id ASC
             LIMIT $2 OFFSET $3",
            Self::select_list(query),
            self.table,
            Self::order_column(query.order_by)
        );
        sqlx::query_as(&sql)
            .bind(query.include_soft_deleted)
            .bind(query.limit.unwrap_or(i64::MAX))
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::storage("record list", e))
    }

    async fn find(&self, id: &str) -> Result<Record> {
        let sql = format!(
            "SELECT id, token, value, created_at, updated_at, expires_at, soft_deleted_at
             FROM {} WHERE id = $1",
            self.table
        );
        sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::storage("record find", e))?
            .ok_or(Error::NotFound)
    }

    async fn find_by_token(&self, token: &str) -> Result<Record> {
        let sql = format!(
            "SELECT id, token, value, created_at, updated_at, expires_at, soft_deleted_at
             FROM {} WHERE token = $1",
            self.table
        );
        sqlx::query_as(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::storage("record find_by_token", e))?
            .ok_or(Error::NotFound)
    }

    async fn update(&self, record: &Record) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET value = $2, expires_at = $3, soft_deleted_at = $4, updated_at = now()
             WHERE id = $1 AND token = $5",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.value)
            .bind(record.expires_at)
            .bind(record.soft_deleted_at)
            .bind(&record.token)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage("record update", e))?;

        if result.rows_affected() == 0 {
            // Either the record doesn't exist, or the caller supplied a mismatched token —
            // both cases are refused per the `id`/`token`-immutability contract.
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage("record delete", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET soft_deleted_at = now(), updated_at = now()
             WHERE id = $1 AND soft_deleted_at IS NULL",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage("record soft_delete", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}
