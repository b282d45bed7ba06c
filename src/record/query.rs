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

//! A pure value type describing a `list`/`count` query, in the spirit of the builder-with-
//! is-set-markers pattern used elsewhere in this crate's configuration types: every field is an
//! `Option`/default, and the repository inspects which ones are set to decide which predicates to
//! apply. There is no hidden shared state.

use crate::{Error, Result};

/// The column to sort by when listing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderColumn {
    #[default]
    CreatedAt,
    UpdatedAt,
}

/// Every column name [`RecordQuery::columns`] will accept. `id` and `token` are always returned
/// regardless of projection — they're the record's addressing keys, not payload — but are valid
/// names here so passing them explicitly is accepted rather than rejected as unknown.
pub const KNOWN_COLUMNS: &[&str] = &[
    "id",
    "token",
    "value",
    "created_at",
    "updated_at",
    "expires_at",
    "soft_deleted_at",
];

/// A query against the record repository.
///
/// Construct with [`RecordQuery::new`] and chain setters, or build the struct literal directly.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub limit: Option<i64>,
    pub offset: i64,
    pub order_by: OrderColumn,
    pub include_soft_deleted: bool,
    /// Column projection: `None` means every column; `Some` restricts `list`'s payload columns
    /// to the named set (`id`/`token` are always included). Useful for skipping the ciphertext
    /// `value` column when a caller only needs to enumerate records.
    pub columns: Option<Vec<String>>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn order_by(mut self, column: OrderColumn) -> Self {
        self.order_by = column;
        self
    }

    pub fn include_soft_deleted(mut self, include: bool) -> Self {
        self.include_soft_deleted = include;
        self
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Whether `column` should be populated in `list`'s results: always true for no projection
    /// or for `id`/`token`, otherwise true only if `column` was named in [`RecordQuery::columns`].
    pub fn selects(&self, column: &str) -> bool {
        match &self.columns {
            None => true,
            Some(columns) => column == "id" || column == "token" || columns.iter().any(|c| c == column),
        }
    }

    /// Reject negative limit/offset and unknown projected column names before any storage
    /// access, per the `InvalidArgument` contract in spec §7.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            if limit < 0 {
                return Err(Error::InvalidArgument(format!("negative limit: {limit}")));
            }
        }
        if self.offset < 0 {
            return Err(Error::InvalidArgument(format!(
                "negative offset: {}",
                self.offset
            )));
        }
        if let Some(columns) = &self.columns {
            for column in columns {
                if !KNOWN_COLUMNS.contains(&column.as_str()) {
                    return Err(Error::InvalidArgument(format!("unknown column: {column}")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_column_is_invalid_argument() {
        let query = RecordQuery::new().columns(vec!["value".to_string(), "bogus".to_string()]);
        assert!(matches!(query.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn known_columns_validate() {
        let query = RecordQuery::new().columns(vec!["value".to_string(), "created_at".to_string()]);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn id_and_token_are_always_selected() {
        let query = RecordQuery::new().columns(vec!["value".to_string()]);
        assert!(query.selects("id"));
        assert!(query.selects("token"));
        assert!(query.selects("value"));
        assert!(!query.selects("created_at"));
    }

    #[test]
    fn no_projection_selects_everything() {
        let query = RecordQuery::new();
        assert!(query.selects("value"));
        assert!(query.selects("soft_deleted_at"));
    }
}
