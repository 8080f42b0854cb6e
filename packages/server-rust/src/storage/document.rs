//! Document types for the persistence sink.
//!
//! A stored item is identified by its [`NaturalKey`]: item id, content type,
//! provider, service request and category. The key is hashed into a stable
//! hex digest that stores use as the primary key.

use opflow_core::context::value_as_u64;
use opflow_core::{ContentType, ProviderId, SrId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Field names the sink writes into every document.
pub mod fields {
    pub const ITEM_ID: &str = "item_id";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const PROVIDER_ID: &str = "provider_id";
    pub const SERVICE_REQUEST_ID: &str = "service_request_id";
    pub const CATEGORY: &str = "category";
    pub const CREATED_AT: &str = "created_at";
    pub const UPDATED_AT: &str = "updated_at";
}

/// Dedup identity of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    /// Canonical string form of the item id, see [`canonical_item_id`].
    pub item_id: String,
    pub content_type: ContentType,
    pub provider_id: ProviderId,
    pub service_request_id: SrId,
    pub category: Option<String>,
}

impl NaturalKey {
    /// Hex SHA-256 over the length-prefixed key fields.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let category = self.category.as_deref().unwrap_or_default();
        for part in [
            self.item_id.as_str(),
            self.content_type.as_str(),
            &self.provider_id.to_string(),
            &self.service_request_id.to_string(),
            category,
        ] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Canonical string form of an item id.
///
/// Numbers and numeric strings compare equal (`42`, `42.0` and `"42"` all
/// map to `"42"`). Other strings are trimmed. `null` and empty strings have
/// no identity.
#[must_use]
pub fn canonical_item_id(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Number(n) => Some(value_as_u64(value).map_or_else(|| n.to_string(), |u| u.to_string())),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else if let Some(u) = value_as_u64(value) {
                Some(u.to_string())
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// A stored item: its natural key plus the extracted fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: NaturalKey,
    pub body: Map<String, Value>,
}

impl Document {
    #[must_use]
    pub fn id(&self) -> String {
        self.key.digest()
    }
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A document with the same natural key already exists.
    Duplicate,
}
