//! `opflow` server: the operation engine that runs configured service
//! requests against third-party HTTP APIs, the interval scheduler, and the
//! HTTP trigger surface.
//!
//! The engine talks to the outside world only through the collaborator
//! traits in [`traits`]; [`transport`] and [`storage`] hold the shipped
//! implementations and [`catalog`] the file-backed configuration source.

pub mod catalog;
pub mod network;
pub mod service;
pub mod storage;
pub mod traits;
pub mod transport;

pub use catalog::{Catalog, CatalogData, CatalogError};
pub use service::{EngineConfig, EngineDeps, OperationEngine, RunReport, RunStatus};
pub use traits::{
    AccessPolicy, CancellationProbe, DocumentStore, OAuthTokenSource, RateGate, RequestObserver,
    Transport,
};
