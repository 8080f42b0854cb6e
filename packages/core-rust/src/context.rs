use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known query-context keys written by the engine itself.
pub mod keys {
    /// Identity of the item a chained or detail call targets.
    pub const ITEM_ID: &str = "item_id";
    pub const OFFSET: &str = "offset";
    pub const PAGE_NUMBER: &str = "page_number";
    pub const PAGE_SIZE: &str = "page_size";
}

/// Per-invocation values that placeholders resolve against.
///
/// Created by the trigger (scheduler, test-run, chained dispatch) and
/// extended by the pagination loop between pages. Cloned, never shared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext {
    /// Free-text query bound to the reserved `[query]` placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Named values available to `[name]` placeholders.
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl QueryContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Reads a non-negative integer, accepting numeric strings.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(value_as_u64)
    }

    #[must_use]
    pub fn item_id(&self) -> Option<&Value> {
        self.get(keys::ITEM_ID)
    }
}

/// Interprets a JSON value as a non-negative integer.
///
/// Accepts integers, integral floats and numeric strings; everything else is
/// `None`.
// Floats are checked integral and non-negative before the cast.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Identity of whoever triggered an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Unique identifier for the authenticated entity.
    pub id: String,
    /// Tenant scope. `None` for single-tenant deployments.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Roles checked by the access policy.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Caller {
    /// The identity the scheduler and queued events run as.
    #[must_use]
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            tenant_id: None,
            roles: vec!["system".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn get_u64_accepts_numeric_strings() {
        let ctx = QueryContext::new()
            .with_value("a", 10)
            .with_value("b", "25")
            .with_value("c", "x")
            .with_value("d", -3);
        assert_eq!(ctx.get_u64("a"), Some(10));
        assert_eq!(ctx.get_u64("b"), Some(25));
        assert_eq!(ctx.get_u64("c"), None);
        assert_eq!(ctx.get_u64("d"), None);
        assert_eq!(ctx.get_u64("missing"), None);
    }

    #[test]
    fn value_as_u64_handles_integral_floats() {
        assert_eq!(value_as_u64(&json!(3.0)), Some(3));
        assert_eq!(value_as_u64(&json!(3.5)), None);
    }

    #[test]
    fn deserializes_without_query() {
        let ctx: QueryContext = serde_json::from_value(json!({"values": {"item_id": 7}})).unwrap();
        assert!(ctx.query.is_none());
        assert_eq!(ctx.item_id(), Some(&json!(7)));
    }
}
