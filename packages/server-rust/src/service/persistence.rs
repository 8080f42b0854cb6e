//! Persistence sink: idempotent insert of extracted items.

use std::sync::Arc;

use opflow_core::{ClockSource, ContentType, EffectiveServiceRequest, Provider, QueryContext, Service};
use serde_json::Value;

use crate::service::operation::OperationError;
use crate::service::response::ExtractedItem;
use crate::storage::{canonical_item_id, fields, Document, InsertOutcome, NaturalKey};
use crate::traits::DocumentStore;

/// Where an invocation's items go and how they are keyed.
#[derive(Debug, Clone, Copy)]
pub struct PersistTarget<'a> {
    pub provider: &'a Provider,
    pub service: &'a Service,
    pub sr: &'a EffectiveServiceRequest,
    pub content_type: ContentType,
}

impl PersistTarget<'_> {
    /// Collection name `{service}_{service_request}`.
    #[must_use]
    pub fn collection(&self) -> String {
        format!("{}_{}", slug(&self.service.name), slug(&self.sr.name))
    }
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Dedup-checks and inserts extracted items into a [`DocumentStore`].
#[derive(Clone)]
pub struct PersistenceSink {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn ClockSource>,
}

impl PersistenceSink {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn ClockSource>) -> Self {
        Self { store, clock }
    }

    /// Stores `item` unless a document with the same natural key exists.
    ///
    /// The item id comes from the item's `item_id` key, falling back to the
    /// invocation context's `item_id` (detail calls reached by chaining).
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Persistence`] when the item has no id or the
    /// store fails.
    pub async fn persist(
        &self,
        target: &PersistTarget<'_>,
        item: &ExtractedItem,
        ctx: &QueryContext,
    ) -> Result<InsertOutcome, OperationError> {
        let raw_id = item
            .item_id
            .as_ref()
            .or_else(|| ctx.item_id())
            .ok_or_else(|| {
                OperationError::Persistence(format!(
                    "item of service request {} has no item id",
                    target.sr.id
                ))
            })?;
        let item_id = canonical_item_id(raw_id).ok_or_else(|| {
            OperationError::Persistence(format!(
                "item of service request {} has an empty item id",
                target.sr.id
            ))
        })?;

        let key = NaturalKey {
            item_id,
            content_type: target.content_type,
            provider_id: target.provider.id,
            service_request_id: target.sr.id,
            category: target.service.category.clone(),
        };
        let collection = target.collection();

        let existing = self
            .store
            .find_one(&collection, &key)
            .await
            .map_err(|e| OperationError::Persistence(format!("lookup in {collection}: {e:#}")))?;
        if existing.is_some() {
            metrics::counter!("opflow_items_persisted_total", "outcome" => "duplicate")
                .increment(1);
            return Ok(InsertOutcome::Duplicate);
        }

        let document = Document {
            body: self.document_body(&key, item),
            key,
        };
        let outcome = self
            .store
            .insert(&collection, document)
            .await
            .map_err(|e| OperationError::Persistence(format!("insert into {collection}: {e:#}")))?;

        let label = match outcome {
            InsertOutcome::Inserted => "inserted",
            InsertOutcome::Duplicate => "duplicate",
        };
        metrics::counter!("opflow_items_persisted_total", "outcome" => label).increment(1);
        Ok(outcome)
    }

    fn document_body(&self, key: &NaturalKey, item: &ExtractedItem) -> serde_json::Map<String, Value> {
        let mut body = item.fields.clone();
        body.entry(fields::ITEM_ID)
            .or_insert_with(|| Value::String(key.item_id.clone()));
        body.insert(
            fields::CONTENT_TYPE.to_string(),
            Value::String(key.content_type.to_string()),
        );
        body.insert(fields::PROVIDER_ID.to_string(), Value::from(key.provider_id.0));
        body.insert(
            fields::SERVICE_REQUEST_ID.to_string(),
            Value::from(key.service_request_id.0),
        );
        if let Some(category) = &key.category {
            body.insert(fields::CATEGORY.to_string(), Value::String(category.clone()));
        }
        let now = Value::String(self.clock.now_utc().to_rfc3339());
        body.entry(fields::CREATED_AT).or_insert_with(|| now.clone());
        body.entry(fields::UPDATED_AT).or_insert(now);
        body
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use opflow_core::{FixedClock, ProviderId, ServiceId, ServiceRequest, SrId, SrType};
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryDocumentStore;

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn find_one(&self, _c: &str, _k: &NaturalKey) -> anyhow::Result<Option<Document>> {
            Ok(None)
        }
        async fn insert(&self, _c: &str, _d: Document) -> anyhow::Result<InsertOutcome> {
            anyhow::bail!("disk full")
        }
        async fn count(&self, _c: &str) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    fn fixtures() -> (Provider, Service, EffectiveServiceRequest) {
        let provider = Provider {
            id: ProviderId(1),
            name: "p".to_string(),
            base_url: "https://x.test".to_string(),
            access_key: None,
            secret_key: None,
            user_id: None,
            properties: std::collections::BTreeMap::new(),
        };
        let service = Service {
            id: ServiceId(2),
            name: "Book Catalog".to_string(),
            category: Some("books".to_string()),
        };
        let sr = ServiceRequest::new(SrId(3), "Search All", ProviderId(1), ServiceId(2), SrType::List);
        (provider, service, EffectiveServiceRequest::standalone(&sr))
    }

    fn item(id: Value) -> ExtractedItem {
        let mut item = ExtractedItem {
            item_id: Some(id.clone()),
            ..ExtractedItem::default()
        };
        item.fields.insert("item_id".to_string(), id);
        item.fields.insert("title".to_string(), json!("Dune"));
        item
    }

    #[tokio::test]
    async fn same_natural_key_is_stored_once() {
        let store = Arc::new(MemoryDocumentStore::new());
        let sink = PersistenceSink::new(store.clone(), Arc::new(FixedClock::new(1_700_000_000_000)));
        let (p, s, sr) = fixtures();
        let target = PersistTarget {
            provider: &p,
            service: &s,
            sr: &sr,
            content_type: ContentType::Json,
        };
        let ctx = QueryContext::new();

        assert_eq!(
            sink.persist(&target, &item(json!(1)), &ctx).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            sink.persist(&target, &item(json!("1")), &ctx).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(target.collection(), "book_catalog_search_all");
        assert_eq!(store.count("book_catalog_search_all").await.unwrap(), 1);

        let doc = store.documents("book_catalog_search_all").remove(0);
        assert_eq!(doc.body["title"], json!("Dune"));
        assert_eq!(doc.body["category"], json!("books"));
        assert_eq!(doc.body["created_at"], json!("2023-11-14T22:13:20+00:00"));
        assert_eq!(doc.body["created_at"], doc.body["updated_at"]);
    }

    #[tokio::test]
    async fn context_item_id_is_the_fallback() {
        let store = Arc::new(MemoryDocumentStore::new());
        let sink = PersistenceSink::new(store.clone(), Arc::new(FixedClock::new(0)));
        let (p, s, sr) = fixtures();
        let target = PersistTarget {
            provider: &p,
            service: &s,
            sr: &sr,
            content_type: ContentType::Xml,
        };
        let mut it = ExtractedItem::default();
        it.fields.insert("name".to_string(), json!("x"));

        let err = sink.persist(&target, &it, &QueryContext::new()).await.unwrap_err();
        assert!(matches!(err, OperationError::Persistence(_)));

        let ctx = QueryContext::new().with_value("item_id", 42);
        sink.persist(&target, &it, &ctx).await.unwrap();
        let doc = store.documents(&target.collection()).remove(0);
        assert_eq!(doc.key.item_id, "42");
        assert_eq!(doc.body["item_id"], json!("42"));
    }

    #[tokio::test]
    async fn store_failures_surface_as_persistence_errors() {
        let sink = PersistenceSink::new(Arc::new(BrokenStore), Arc::new(FixedClock::new(0)));
        let (p, s, sr) = fixtures();
        let target = PersistTarget {
            provider: &p,
            service: &s,
            sr: &sr,
            content_type: ContentType::Json,
        };
        let err = sink
            .persist(&target, &item(json!(5)), &QueryContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Persistence(msg) if msg.contains("disk full")));
    }
}
