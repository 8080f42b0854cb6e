//! Response-key chaining: turns an extracted item into dispatches of
//! dependent service requests.

use opflow_core::context::keys;
use opflow_core::{Action, ChainLink, EffectiveServiceRequest, QueryContext, SrId};
use serde_json::Value;
use tracing::debug;

use crate::service::operation::OperationError;
use crate::service::response::ExtractedItem;

/// One dependent invocation produced by a chain link.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainDispatch {
    pub target: SrId,
    /// Response key on the triggering Sr that fired the link.
    pub response_key: String,
    /// Only the forwarded fields plus `item_id`.
    pub query: QueryContext,
}

/// Evaluates an Sr's chain links against extracted items.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainDispatcher {
    skip_missing_forwarded_fields: bool,
}

impl ChainDispatcher {
    #[must_use]
    pub fn new(skip_missing_forwarded_fields: bool) -> Self {
        Self {
            skip_missing_forwarded_fields,
        }
    }

    /// Dispatches for `item` across every chain link of `sr`.
    ///
    /// A link fires when the item has a value for its response key, its
    /// action is `store` and it is not disabled. An array value fires once
    /// per element.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Extraction`] when a forwarded field is
    /// missing from the item, unless the dispatcher skips such links.
    pub fn dispatches(
        &self,
        sr: &EffectiveServiceRequest,
        item: &ExtractedItem,
    ) -> Result<Vec<ChainDispatch>, OperationError> {
        let mut out = Vec::new();
        for link in &sr.chain_links {
            let Some(trigger) = item.get(&link.response_key).filter(|v| !v.is_null()) else {
                continue;
            };
            if link.action != Action::Store || link.disable_request {
                debug!(
                    sr_id = %sr.id,
                    target = %link.target_sr_id,
                    response_key = %link.response_key,
                    "chain link inactive"
                );
                continue;
            }
            let Some(base) = self.forwarded_context(sr.id, link, item)? else {
                continue;
            };

            let values: Vec<&Value> = match trigger {
                Value::Array(elements) => elements.iter().filter(|v| !v.is_null()).collect(),
                other => vec![other],
            };
            for value in values {
                let mut query = base.clone();
                query.insert(keys::ITEM_ID, value.clone());
                out.push(ChainDispatch {
                    target: link.target_sr_id,
                    response_key: link.response_key.clone(),
                    query,
                });
            }
        }
        Ok(out)
    }

    fn forwarded_context(
        &self,
        sr_id: SrId,
        link: &ChainLink,
        item: &ExtractedItem,
    ) -> Result<Option<QueryContext>, OperationError> {
        let mut ctx = QueryContext::new();
        for field in &link.request_response_keys {
            match item.get(field) {
                Some(value) => ctx.insert(field.clone(), value.clone()),
                None if self.skip_missing_forwarded_fields => {
                    debug!(
                        sr_id = %sr_id,
                        target = %link.target_sr_id,
                        field = %field,
                        "skipping chain link with missing forwarded field"
                    );
                    return Ok(None);
                }
                None => {
                    return Err(OperationError::Extraction(format!(
                        "chain link {} -> {} forwards `{field}` which the item lacks",
                        sr_id, link.target_sr_id
                    )))
                }
            }
        }
        Ok(Some(ctx))
    }
}

#[cfg(test)]
mod tests {
    use opflow_core::{ProviderId, ServiceId, ServiceRequest, SrType};
    use serde_json::json;

    use super::*;

    fn link(key: &str, target: u64, forwarded: &[&str]) -> ChainLink {
        ChainLink {
            response_key: key.to_string(),
            target_sr_id: SrId(target),
            action: Action::Store,
            disable_request: false,
            request_response_keys: forwarded.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn sr(links: Vec<ChainLink>) -> EffectiveServiceRequest {
        let mut sr = ServiceRequest::new(SrId(1), "a", ProviderId(1), ServiceId(1), SrType::List);
        sr.chain_links = links;
        EffectiveServiceRequest::standalone(&sr)
    }

    fn item(pairs: &[(&str, Value)]) -> ExtractedItem {
        let mut item = ExtractedItem::default();
        for (k, v) in pairs {
            item.fields.insert((*k).to_string(), v.clone());
        }
        item
    }

    #[test]
    fn present_value_triggers_exactly_one_dispatch() {
        let s = sr(vec![link("category_id", 2, &[])]);
        let mut it = item(&[("title", json!("x"))]);
        it.triggers.insert("category_id".to_string(), json!(42));

        let out = ChainDispatcher::default().dispatches(&s, &it).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, SrId(2));
        assert_eq!(out[0].query.item_id(), Some(&json!(42)));
        assert!(!out[0].query.contains("title"));
    }

    #[test]
    fn only_forwarded_fields_are_carried() {
        let s = sr(vec![link("category_id", 2, &["title"])]);
        let it = item(&[
            ("category_id", json!("c-1")),
            ("title", json!("x")),
            ("other", json!(true)),
        ]);
        let out = ChainDispatcher::default().dispatches(&s, &it).unwrap();
        assert_eq!(out[0].query.get("title"), Some(&json!("x")));
        assert!(!out[0].query.contains("other"));
        assert_eq!(out[0].query.values.len(), 2);
    }

    #[test]
    fn absent_value_disabled_or_non_store_links_do_not_fire() {
        let mut disabled = link("a", 2, &[]);
        disabled.disable_request = true;
        let mut returning = link("b", 3, &[]);
        returning.action = Action::Return;
        let s = sr(vec![disabled, returning, link("c", 4, &[])]);
        let it = item(&[("a", json!(1)), ("b", json!(2)), ("c", Value::Null)]);
        assert!(ChainDispatcher::default().dispatches(&s, &it).unwrap().is_empty());
    }

    #[test]
    fn missing_forwarded_field_aborts_by_default() {
        let s = sr(vec![link("id", 2, &["missing"])]);
        let it = item(&[("id", json!(1))]);
        let err = ChainDispatcher::default().dispatches(&s, &it).unwrap_err();
        assert!(matches!(err, OperationError::Extraction(_)));
    }

    #[test]
    fn missing_forwarded_field_can_be_skipped() {
        let s = sr(vec![link("id", 2, &["missing"]), link("id", 3, &[])]);
        let it = item(&[("id", json!(1))]);
        let out = ChainDispatcher::new(true).dispatches(&s, &it).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, SrId(3));
    }

    #[test]
    fn array_trigger_fans_out() {
        let s = sr(vec![link("ids", 2, &[])]);
        let it = item(&[("ids", json!([1, null, 3]))]);
        let out = ChainDispatcher::default().dispatches(&s, &it).unwrap();
        let ids: Vec<_> = out.iter().map(|d| d.query.item_id().cloned()).collect();
        assert_eq!(ids, vec![Some(json!(1)), Some(json!(3))]);
    }
}
