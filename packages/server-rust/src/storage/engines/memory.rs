//! In-memory [`DocumentStore`] backed by [`DashMap`].
//!
//! Insert-if-absent is a single entry operation on the shard holding the
//! key, so concurrent runs inserting the same item store it once.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::storage::document::{Document, InsertOutcome, NaturalKey};
use crate::traits::DocumentStore;

/// In-memory document store keyed by `(collection, natural-key digest)`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<(String, String), Document>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every document in `collection`.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Names of collections holding at least one document, sorted.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .documents
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_one(
        &self,
        collection: &str,
        key: &NaturalKey,
    ) -> anyhow::Result<Option<Document>> {
        let id = (collection.to_string(), key.digest());
        Ok(self.documents.get(&id).map(|d| d.value().clone()))
    }

    async fn insert(&self, collection: &str, document: Document) -> anyhow::Result<InsertOutcome> {
        let id = (collection.to_string(), document.id());
        match self.documents.entry(id) {
            Entry::Occupied(_) => Ok(InsertOutcome::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(document);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn count(&self, collection: &str) -> anyhow::Result<usize> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opflow_core::{ContentType, ProviderId, SrId};
    use serde_json::{json, Map};

    use super::*;

    fn doc(item_id: &str, title: &str) -> Document {
        let mut body = Map::new();
        body.insert("title".to_string(), json!(title));
        Document {
            key: NaturalKey {
                item_id: item_id.to_string(),
                content_type: ContentType::Json,
                provider_id: ProviderId(1),
                service_request_id: SrId(1),
                category: None,
            },
            body,
        }
    }

    #[tokio::test]
    async fn second_insert_of_same_key_is_a_noop() {
        let store = MemoryDocumentStore::new();
        assert_eq!(
            store.insert("books_search", doc("1", "a")).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert("books_search", doc("1", "b")).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.count("books_search").await.unwrap(), 1);

        let found = store
            .find_one("books_search", &doc("1", "").key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body["title"], json!("a"));
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let store = MemoryDocumentStore::new();
        store.insert("a_x", doc("1", "a")).await.unwrap();
        store.insert("b_y", doc("1", "a")).await.unwrap();
        assert_eq!(store.count("a_x").await.unwrap(), 1);
        assert_eq!(store.collections(), vec!["a_x".to_string(), "b_y".to_string()]);
        assert!(store.find_one("c_z", &doc("1", "").key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_inserts_store_once() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert("c", doc("7", "x")).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.len(), 1);
    }
}
