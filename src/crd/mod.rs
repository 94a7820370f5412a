//! Custom Resource Definitions
//!
//! The `helm.fluxcd.io/v1` API group with the HelmRelease resource and its
//! supporting types.

mod release;
mod types;

pub use release::{
    HelmRelease, HelmReleaseSpec, HelmReleaseStatus, ANTECEDENT_ANNOTATION, MIGRATE_ANNOTATION,
};
pub use types::{
    ChartSource, CloudProvider, ConditionStatus, CustomizeSource, GitChartSource,
    HelmReleaseCondition, HelmReleaseConditionType, HelmReleasePhase, HelmVersion, OssSource,
    RepoChartSource, RollbackSpec, SourceKind, TestSpec, ValuesFromSource, ValuesKeySelector,
};
