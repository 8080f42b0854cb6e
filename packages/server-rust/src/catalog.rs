//! JSON catalog: the standalone [`ConfigSource`].
//!
//! Holds providers, services and service requests loaded from a JSON
//! document of the shape
//! `{"providers": [...], "services": [...], "service_requests": [...]}`.
//! References between records are validated on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use opflow_core::{ConfigSource, Provider, ProviderId, Service, ServiceId, ServiceRequest, SrId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Errors raised while loading or validating a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// Serialized catalog document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogData {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub service_requests: Vec<ServiceRequest>,
}

#[derive(Debug, Default)]
struct Indexed {
    providers: BTreeMap<ProviderId, Provider>,
    services: BTreeMap<ServiceId, Service>,
    service_requests: BTreeMap<SrId, ServiceRequest>,
}

impl Indexed {
    fn build(data: CatalogData) -> Result<Self, CatalogError> {
        let mut idx = Self::default();
        for p in data.providers {
            if let Some(dup) = idx.providers.insert(p.id, p) {
                return Err(CatalogError::Invalid(format!("duplicate provider id {}", dup.id)));
            }
        }
        for s in data.services {
            if let Some(dup) = idx.services.insert(s.id, s) {
                return Err(CatalogError::Invalid(format!("duplicate service id {}", dup.id)));
            }
        }
        for sr in data.service_requests {
            if let Some(dup) = idx.service_requests.insert(sr.id, sr) {
                return Err(CatalogError::Invalid(format!(
                    "duplicate service request id {}",
                    dup.id
                )));
            }
        }
        idx.validate()?;
        Ok(idx)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for sr in self.service_requests.values() {
            self.validate_sr(sr)?;
        }
        Ok(())
    }

    fn validate_sr(&self, sr: &ServiceRequest) -> Result<(), CatalogError> {
        if !self.providers.contains_key(&sr.provider_id) {
            return Err(CatalogError::Invalid(format!(
                "service request {} references unknown provider {}",
                sr.id, sr.provider_id
            )));
        }
        if !self.services.contains_key(&sr.service_id) {
            return Err(CatalogError::Invalid(format!(
                "service request {} references unknown service {}",
                sr.id, sr.service_id
            )));
        }
        if let Some(parent) = sr.parent {
            if !self.service_requests.contains_key(&parent.parent_id) {
                return Err(CatalogError::Invalid(format!(
                    "service request {} references unknown parent {}",
                    sr.id, parent.parent_id
                )));
            }
        }
        for link in &sr.chain_links {
            if !self.service_requests.contains_key(&link.target_sr_id) {
                return Err(CatalogError::Invalid(format!(
                    "chain link {} -> {} targets an unknown service request",
                    sr.id, link.target_sr_id
                )));
            }
        }
        Ok(())
    }
}

/// In-memory catalog, optionally backed by a JSON file that can be reloaded.
#[derive(Debug, Default)]
pub struct Catalog {
    path: Option<PathBuf>,
    inner: RwLock<Indexed>,
}

impl Catalog {
    /// Builds a catalog from already-parsed data.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Invalid`] for duplicate ids or dangling
    /// references.
    pub fn from_data(data: CatalogData) -> Result<Self, CatalogError> {
        Ok(Self {
            path: None,
            inner: RwLock::new(Indexed::build(data)?),
        })
    }

    /// # Errors
    ///
    /// Returns a parse or validation error.
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        Self::from_data(serde_json::from_str(json)?)
    }

    /// Loads and validates the catalog file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O, parse or validation error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        let data = read_file(&path)?;
        let catalog = Self {
            inner: RwLock::new(Indexed::build(data)?),
            path: Some(path),
        };
        info!(
            path = %catalog.path.as_deref().unwrap_or(Path::new("")).display(),
            service_requests = catalog.inner.read().service_requests.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Re-reads the backing file. The current contents stay in place when
    /// the new file is invalid.
    ///
    /// # Errors
    ///
    /// Returns an error when there is no backing file or it fails to load.
    pub fn reload(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.path else {
            return Err(CatalogError::Invalid("catalog has no backing file".to_string()));
        };
        let indexed = Indexed::build(read_file(path)?)?;
        *self.inner.write() = indexed;
        info!(path = %path.display(), "catalog reloaded");
        Ok(())
    }

    /// Replaces or adds one service request.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Invalid`] when its references do not resolve.
    pub fn upsert_service_request(&self, sr: ServiceRequest) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();
        inner.validate_sr(&sr)?;
        inner.service_requests.insert(sr.id, sr);
        Ok(())
    }

    /// Snapshot of the current contents.
    #[must_use]
    pub fn data(&self) -> CatalogData {
        let inner = self.inner.read();
        CatalogData {
            providers: inner.providers.values().cloned().collect(),
            services: inner.services.values().cloned().collect(),
            service_requests: inner.service_requests.values().cloned().collect(),
        }
    }
}

fn read_file(path: &Path) -> Result<CatalogData, CatalogError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[async_trait]
impl ConfigSource for Catalog {
    async fn provider(&self, id: ProviderId) -> anyhow::Result<Option<Provider>> {
        Ok(self.inner.read().providers.get(&id).cloned())
    }

    async fn service(&self, id: ServiceId) -> anyhow::Result<Option<Service>> {
        Ok(self.inner.read().services.get(&id).cloned())
    }

    async fn service_request(&self, id: SrId) -> anyhow::Result<Option<ServiceRequest>> {
        Ok(self.inner.read().service_requests.get(&id).cloned())
    }

    async fn list_service_requests(&self) -> anyhow::Result<Vec<ServiceRequest>> {
        Ok(self.inner.read().service_requests.values().cloned().collect())
    }
}
