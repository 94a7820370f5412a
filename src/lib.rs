//! Helm operator - Kubernetes controller for HelmRelease resources
//!
//! The operator reconciles `helm.fluxcd.io/v1` HelmRelease resources
//! against the actual state of Helm-managed workloads: it fetches the
//! declared chart, decides whether to install, upgrade, migrate, roll back,
//! uninstall, or do nothing, and rewrites the rendered manifests before
//! they reach the cluster.
//!
//! # Modules
//!
//! - [`crd`] - the HelmRelease custom resource and its supporting types
//! - [`operator`] - work queue controller: watch intake, workers, per-key locks
//! - [`release`] - sync engine: decision machine, action loop, post-renderer
//! - [`chartsync`] - chart source resolution (git, repo, URL, object store)
//! - [`helm`] - Helm client abstraction and CLI implementation
//! - [`status`] - status subresource writes and predicates
//! - [`metrics`] - prometheus metrics
//! - [`error`] - error kinds and the per-reconciliation aggregate

#![deny(missing_docs)]

pub mod chartsync;
pub mod crd;
pub mod error;
pub mod helm;
pub mod metrics;
pub mod operator;
pub mod release;
pub mod status;

pub use error::Error;

/// Result type alias using the operator's error type
pub type Result<T> = std::result::Result<T, Error>;
