//! Effective configuration: a service request merged with its ancestors.
//!
//! A child Sr inherits each category (config, parameters, response keys,
//! schedule, rate limit) from its parent unless the matching override flag on
//! the parent link is set. The merge is pure and recomputed per call.

use serde::{Deserialize, Serialize};

use crate::model::{
    config_names, response_key_names, ChainLink, ConfigPair, InheritanceOverrides,
    ResponseKey, ServiceRequest, SrConfigItem, SrParameter, SrRateLimit, SrSchedule,
};
use crate::types::{PaginationType, ProviderId, ServiceId, SrId, SrType};

/// Upper bound on parent hops followed while resolving inheritance.
pub const MAX_INHERITANCE_DEPTH: usize = 16;

/// Errors raised while resolving an Sr's ancestry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InheritanceError {
    #[error("parent service request {parent} of {child} not found")]
    MissingParent { child: SrId, parent: SrId },
    #[error("inheritance chain of service request {0} is cyclic or deeper than {MAX_INHERITANCE_DEPTH}")]
    TooDeep(SrId),
}

/// The configuration an invocation actually runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveServiceRequest {
    pub id: SrId,
    pub name: String,
    pub provider_id: ProviderId,
    pub service_id: ServiceId,
    pub sr_type: SrType,
    pub pagination_type: PaginationType,
    pub config: Vec<SrConfigItem>,
    pub parameters: Vec<SrParameter>,
    pub response_keys: Vec<ResponseKey>,
    pub schedule: Option<SrSchedule>,
    pub rate_limit: Option<SrRateLimit>,
    /// Chain links always belong to the Sr itself.
    pub chain_links: Vec<ChainLink>,
}

impl EffectiveServiceRequest {
    /// Effective view of an Sr with no parent.
    #[must_use]
    pub fn standalone(sr: &ServiceRequest) -> Self {
        Self {
            id: sr.id,
            name: sr.name.clone(),
            provider_id: sr.provider_id,
            service_id: sr.service_id,
            sr_type: sr.sr_type,
            pagination_type: sr.pagination_type,
            config: sr.config.clone(),
            parameters: sr.parameters.clone(),
            response_keys: sr.response_keys.clone(),
            schedule: sr.schedule.clone(),
            rate_limit: sr.rate_limit,
            chain_links: sr.chain_links.clone(),
        }
    }

    /// Non-empty, trimmed text value of a config item.
    #[must_use]
    pub fn config_value(&self, name: &str) -> Option<&str> {
        self.config
            .iter()
            .find(|item| item.name == name)
            .and_then(|item| item.value.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Array value of a config item, empty when absent.
    #[must_use]
    pub fn config_pairs(&self, name: &str) -> &[ConfigPair] {
        self.config
            .iter()
            .find(|item| item.name == name)
            .map_or(&[], |item| item.array_value.as_slice())
    }

    #[must_use]
    pub fn response_key(&self, name: &str) -> Option<&ResponseKey> {
        self.response_keys.iter().find(|k| k.name == name)
    }

    /// Page size declared by a `page_size` response key whose value is a
    /// literal integer rather than a path.
    #[must_use]
    pub fn default_page_size(&self) -> Option<u64> {
        self.response_key(response_key_names::PAGE_SIZE)
            .and_then(|k| k.value.trim().parse().ok())
            .filter(|n| *n > 0)
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.config_value(config_names::ENDPOINT)
    }

    /// `true` when a schedule exists and is not disabled.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.schedule.as_ref().is_some_and(|s| !s.disabled)
    }
}

/// Merges `child` over an already-effective `parent`.
///
/// Identity, type, pagination and chain links come from the child. Each
/// inheritable category comes from the child when its override flag is set
/// and from the parent otherwise.
#[must_use]
pub fn merge(
    child: &ServiceRequest,
    parent: &EffectiveServiceRequest,
    overrides: InheritanceOverrides,
) -> EffectiveServiceRequest {
    let mut merged = EffectiveServiceRequest::standalone(child);
    if !overrides.config {
        merged.config.clone_from(&parent.config);
    }
    if !overrides.parameters {
        merged.parameters.clone_from(&parent.parameters);
    }
    if !overrides.response_keys {
        merged.response_keys.clone_from(&parent.response_keys);
    }
    if !overrides.schedule {
        merged.schedule.clone_from(&parent.schedule);
    }
    if !overrides.rate_limit {
        merged.rate_limit = parent.rate_limit;
    }
    merged
}

/// Resolves the effective configuration of `sr`, following parent links
/// through `lookup` up to [`MAX_INHERITANCE_DEPTH`] hops.
///
/// # Errors
///
/// Returns [`InheritanceError::MissingParent`] when a parent id does not
/// resolve, and [`InheritanceError::TooDeep`] for cycles or overly long
/// chains.
pub fn resolve<F>(sr: &ServiceRequest, lookup: F) -> Result<EffectiveServiceRequest, InheritanceError>
where
    F: Fn(SrId) -> Option<ServiceRequest>,
{
    // Collect ancestry child-first, then fold from the root down.
    let mut lineage = vec![sr.clone()];
    while let Some(link) = lineage.last().and_then(|s| s.parent) {
        if lineage.len() > MAX_INHERITANCE_DEPTH {
            return Err(InheritanceError::TooDeep(sr.id));
        }
        let child_id = lineage.last().map_or(sr.id, |s| s.id);
        let parent = lookup(link.parent_id).ok_or(InheritanceError::MissingParent {
            child: child_id,
            parent: link.parent_id,
        })?;
        lineage.push(parent);
    }

    let mut iter = lineage.iter().rev();
    let Some(root) = iter.next() else {
        return Ok(EffectiveServiceRequest::standalone(sr));
    };
    let mut effective = EffectiveServiceRequest::standalone(root);
    for child in iter {
        let overrides = child.parent.map(|p| p.overrides).unwrap_or_default();
        effective = merge(child, &effective, overrides);
    }
    Ok(effective)
}
