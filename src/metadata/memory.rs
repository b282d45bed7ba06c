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
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Error, Result};

use super::MetadataRepository;

type Key = (String, String, String);

/// An in-memory [`MetadataRepository`] guarded by a single `RwLock`, giving the same
/// last-writer-wins semantics on concurrent `upsert` the spec requires of a real table.
#[derive(Debug, Default)]
pub struct MemoryMetadataRepository {
    rows: RwLock<HashMap<Key, String>>,
}

impl MemoryMetadataRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataRepository for MemoryMetadataRepository {
    async fn upsert(
        &self,
        object_type: &str,
        object_id: &str,
        meta_key: &str,
        meta_value: &str,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(
            (object_type.to_string(), object_id.to_string(), meta_key.to_string()),
            meta_value.to_string(),
        );
        Ok(())
    }

    async fn list_by_type(&self, object_type: &str, meta_key: &str) -> Result<Vec<(String, String)>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|((ot, _, mk), _)| ot == object_type && mk == meta_key)
            .map(|((_, oid, _), mv)| (oid.clone(), mv.clone()))
            .collect())
    }

    async fn get(&self, object_type: &str, object_id: &str, meta_key: &str) -> Result<String> {
        let rows = self.rows.read().await;
        rows.get(&(object_type.to_string(), object_id.to_string(), meta_key.to_string()))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn delete_by_object(&self, object_type: &str, object_id: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.retain(|(ot, oid, _), _| !(ot == object_type && oid == object_id));
        Ok(())
    }

    async fn list_record_ids_linked_to(&self, password_id: &str) -> Result<Vec<String>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|((ot, _, mk), mv)| ot == "record" && mk == "password_id" && mv.as_str() == password_id)
            .map(|((_, oid, _), _)| oid.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_last_writer_wins() {
        let repo = MemoryMetadataRepository::new();
        repo.upsert("record", "r1", "password_id", "p_one").await.unwrap();
        repo.upsert("record", "r1", "password_id", "p_two").await.unwrap();
        assert_eq!(repo.get("record", "r1", "password_id").await.unwrap(), "p_two");
    }

    #[tokio::test]
    async fn list_record_ids_linked_to_filters_by_value() {
        let repo = MemoryMetadataRepository::new();
        repo.upsert("record", "r1", "password_id", "p_a").await.unwrap();
        repo.upsert("record", "r2", "password_id", "p_b").await.unwrap();
        repo.upsert("record", "r3", "password_id", "p_a").await.unwrap();
        let mut linked = repo.list_record_ids_linked_to("p_a").await.unwrap();
        linked.sort();
        assert_eq!(linked, vec!["r1".to_string(), "r3".to_string()]);
    }

    #[tokio::test]
    async fn delete_by_object_removes_only_that_object() {
        let repo = MemoryMetadataRepository::new();
        repo.upsert("record", "r1", "password_id", "p_a").await.unwrap();
        repo.upsert("record", "r2", "password_id", "p_a").await.unwrap();
        repo.delete_by_object("record", "r1").await.unwrap();
        assert!(repo.get("record", "r1", "password_id").await.is_err());
        assert!(repo.get("record", "r2", "password_id").await.is_ok());
    }
}
