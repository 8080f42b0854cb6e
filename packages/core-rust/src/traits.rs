use std::collections::HashMap;

use async_trait::async_trait;

use crate::effective::{self, EffectiveServiceRequest, MAX_INHERITANCE_DEPTH};
use crate::model::{Provider, Service, ServiceRequest};
use crate::types::{ProviderId, ServiceId, SrId};

/// Read-only view of the management plane's configuration.
///
/// The engine never writes through this interface; CRUD of providers,
/// services and service requests happens elsewhere.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn provider(&self, id: ProviderId) -> anyhow::Result<Option<Provider>>;

    async fn service(&self, id: ServiceId) -> anyhow::Result<Option<Service>>;

    async fn service_request(&self, id: SrId) -> anyhow::Result<Option<ServiceRequest>>;

    /// Every configured service request, in id order.
    async fn list_service_requests(&self) -> anyhow::Result<Vec<ServiceRequest>>;

    /// Loads `id` with its ancestors and merges them into the effective view.
    ///
    /// Returns `Ok(None)` when `id` itself does not exist.
    ///
    /// # Errors
    ///
    /// Propagates source failures and inheritance errors (missing parent,
    /// cyclic or overly deep ancestry).
    async fn effective_service_request(
        &self,
        id: SrId,
    ) -> anyhow::Result<Option<EffectiveServiceRequest>> {
        let Some(sr) = self.service_request(id).await? else {
            return Ok(None);
        };

        let mut ancestors: HashMap<SrId, ServiceRequest> = HashMap::new();
        let mut next = sr.parent.map(|p| p.parent_id);
        while let Some(parent_id) = next {
            if ancestors.contains_key(&parent_id) || ancestors.len() > MAX_INHERITANCE_DEPTH {
                break;
            }
            let Some(parent) = self.service_request(parent_id).await? else {
                break;
            };
            next = parent.parent.map(|p| p.parent_id);
            ancestors.insert(parent_id, parent);
        }

        let resolved = effective::resolve(&sr, |pid| ancestors.get(&pid).cloned())?;
        Ok(Some(resolved))
    }
}
