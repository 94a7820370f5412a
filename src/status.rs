//! Status subresource writes and status-derived predicates
//!
//! The engine exclusively owns the status of a HelmRelease. Every phase
//! transition goes through [`StatusClient`]; the kube-backed implementation
//! merge-patches the status subresource, tests capture the writes through
//! the generated mock.

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    ConditionStatus, HelmRelease, HelmReleaseCondition, HelmReleaseConditionType, HelmReleasePhase,
};
use crate::Error;

/// Field manager recorded on status patches
const STATUS_MANAGER: &str = "helm-operator";

/// Writer for the HelmRelease status subresource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Record a phase transition, optionally updating the last attempted
    /// revision, and derive the matching condition update
    async fn set_phase(
        &self,
        hr: &HelmRelease,
        phase: HelmReleasePhase,
        revision: Option<String>,
    ) -> Result<(), Error>;

    /// Record the spec generation that was acted upon
    async fn set_observed_generation(&self, hr: &HelmRelease, generation: i64)
        -> Result<(), Error>;

    /// Record the rollback counter (reset on successful upgrades)
    async fn set_rollback_count(&self, hr: &HelmRelease, count: i64) -> Result<(), Error>;

    /// Reset all conditions to Unknown (used when the resource is deleted)
    async fn clear_conditions(&self, hr: &HelmRelease) -> Result<(), Error>;
}

/// Condition update implied by a phase transition
fn condition_for_phase(
    phase: HelmReleasePhase,
) -> Option<(HelmReleaseConditionType, ConditionStatus, &'static str)> {
    use HelmReleasePhase::*;
    match phase {
        Deployed => Some((
            HelmReleaseConditionType::Released,
            ConditionStatus::True,
            "HelmDeploySucceeded",
        )),
        DeployFailed => Some((
            HelmReleaseConditionType::Released,
            ConditionStatus::False,
            "HelmDeployFailed",
        )),
        Tested => Some((
            HelmReleaseConditionType::Tested,
            ConditionStatus::True,
            "HelmTestSucceeded",
        )),
        TestFailed => Some((
            HelmReleaseConditionType::Tested,
            ConditionStatus::False,
            "HelmTestFailed",
        )),
        RolledBack => Some((
            HelmReleaseConditionType::RolledBack,
            ConditionStatus::True,
            "HelmRollbackSucceeded",
        )),
        RollbackFailed => Some((
            HelmReleaseConditionType::RolledBack,
            ConditionStatus::False,
            "HelmRollbackFailed",
        )),
        _ => None,
    }
}

/// Replace or append the condition of the same type, keeping the transition
/// timestamp when the status did not flip
pub fn upsert_condition(
    mut conditions: Vec<HelmReleaseCondition>,
    update: HelmReleaseCondition,
) -> Vec<HelmReleaseCondition> {
    match conditions.iter_mut().find(|c| c.type_ == update.type_) {
        Some(existing) => {
            let transition_time = if existing.status == update.status {
                existing.last_transition_time
            } else {
                update.last_transition_time
            };
            *existing = HelmReleaseCondition {
                last_transition_time: transition_time,
                ..update
            };
        }
        None => conditions.push(update),
    }
    conditions
}

/// Status writer backed by the Kubernetes API
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    /// Create a writer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, hr: &HelmRelease) -> Api<HelmRelease> {
        let namespace = hr.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }

    async fn patch(&self, hr: &HelmRelease, status: serde_json::Value) -> Result<(), Error> {
        self.api_for(hr)
            .patch_status(
                &hr.name_any(),
                &PatchParams::apply(STATUS_MANAGER),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn set_phase(
        &self,
        hr: &HelmRelease,
        phase: HelmReleasePhase,
        revision: Option<String>,
    ) -> Result<(), Error> {
        let mut status = json!({
            "phase": phase,
            "releaseName": hr.release_name(),
        });
        if let Some(revision) = revision {
            status["lastAttemptedRevision"] = json!(revision);
        }
        if let Some((type_, cond_status, reason)) = condition_for_phase(phase) {
            let existing = hr
                .status
                .as_ref()
                .map(|s| s.conditions.clone())
                .unwrap_or_default();
            let update = HelmReleaseCondition::new(
                type_,
                cond_status,
                reason,
                format!("phase transition to {phase}"),
            );
            status["conditions"] = json!(upsert_condition(existing, update));
        }
        self.patch(hr, status).await
    }

    async fn set_observed_generation(
        &self,
        hr: &HelmRelease,
        generation: i64,
    ) -> Result<(), Error> {
        self.patch(hr, json!({ "observedGeneration": generation }))
            .await
    }

    async fn set_rollback_count(&self, hr: &HelmRelease, count: i64) -> Result<(), Error> {
        self.patch(hr, json!({ "rollbackCount": count })).await
    }

    async fn clear_conditions(&self, hr: &HelmRelease) -> Result<(), Error> {
        let now = Utc::now();
        let cleared: Vec<HelmReleaseCondition> = hr
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|c| HelmReleaseCondition {
                status: ConditionStatus::Unknown,
                reason: Some("ReleaseDeleted".to_string()),
                message: None,
                last_update_time: Some(now),
                last_transition_time: Some(now),
                ..c
            })
            .collect();
        self.patch(hr, json!({ "conditions": cleared })).await
    }
}

/// Whether the current spec generation has been acted upon
pub fn has_synced(hr: &HelmRelease) -> bool {
    let observed = hr
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or(0);
    observed >= hr.generation()
}

/// Whether the deployed release was rolled back
pub fn has_rolled_back(hr: &HelmRelease) -> bool {
    hr.status
        .as_ref()
        .map(|s| {
            s.conditions.iter().any(|c| {
                c.type_ == HelmReleaseConditionType::RolledBack
                    && c.status == ConditionStatus::True
            })
        })
        .unwrap_or(false)
}

/// Whether a rolled-back release should retry its upgrade: the rollback
/// retry policy is on and the retry budget is not exhausted
pub fn should_retry_upgrade(hr: &HelmRelease) -> bool {
    if !hr.spec.rollback.retry {
        return false;
    }
    let count = hr
        .status
        .as_ref()
        .and_then(|s| s.rollback_count)
        .unwrap_or(0);
    count < hr.spec.rollback.get_max_retries()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{HelmReleaseSpec, HelmReleaseStatus, RollbackSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn release(generation: i64, status: Option<HelmReleaseStatus>) -> HelmRelease {
        HelmRelease {
            metadata: ObjectMeta {
                name: Some("podinfo".to_string()),
                namespace: Some("apps".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: HelmReleaseSpec::default(),
            status,
        }
    }

    // =========================================================================
    // Sync Predicates
    // =========================================================================

    /// Story: a freshly created resource has never been synced
    #[test]
    fn story_new_resource_has_not_synced() {
        assert!(!has_synced(&release(1, None)));
    }

    /// Story: after a reconciliation the observed generation catches up
    #[test]
    fn story_observed_generation_marks_sync() {
        let hr = release(
            2,
            Some(HelmReleaseStatus {
                observed_generation: Some(2),
                ..Default::default()
            }),
        );
        assert!(has_synced(&hr));
    }

    /// Story: a spec edit bumps the generation and the resource counts as
    /// unsynced again
    #[test]
    fn story_spec_edit_resets_sync() {
        let hr = release(
            3,
            Some(HelmReleaseStatus {
                observed_generation: Some(2),
                ..Default::default()
            }),
        );
        assert!(!has_synced(&hr));
    }

    #[test]
    fn rolled_back_follows_condition() {
        let mut hr = release(1, Some(HelmReleaseStatus::default()));
        assert!(!has_rolled_back(&hr));

        hr.status.as_mut().unwrap().conditions.push(HelmReleaseCondition::new(
            HelmReleaseConditionType::RolledBack,
            ConditionStatus::True,
            "HelmRollbackSucceeded",
            "rolled back",
        ));
        assert!(has_rolled_back(&hr));
    }

    /// Story: the retry budget caps upgrade retries after rollbacks
    #[test]
    fn story_retry_budget_is_bounded() {
        let mut hr = release(1, Some(HelmReleaseStatus::default()));
        hr.spec.rollback = RollbackSpec {
            enable: true,
            retry: true,
            max_retries: Some(2),
            ..Default::default()
        };
        assert!(should_retry_upgrade(&hr));

        hr.status.as_mut().unwrap().rollback_count = Some(2);
        assert!(!should_retry_upgrade(&hr));
    }

    #[test]
    fn retry_requires_policy() {
        let hr = release(1, Some(HelmReleaseStatus::default()));
        assert!(!should_retry_upgrade(&hr));
    }

    // =========================================================================
    // Condition Bookkeeping
    // =========================================================================

    /// An unchanged status keeps its transition time while the update time
    /// advances
    #[test]
    fn upsert_preserves_transition_time_without_flip() {
        let first = HelmReleaseCondition::new(
            HelmReleaseConditionType::Released,
            ConditionStatus::True,
            "HelmDeploySucceeded",
            "deployed",
        );
        let original_transition = first.last_transition_time;

        let update = HelmReleaseCondition::new(
            HelmReleaseConditionType::Released,
            ConditionStatus::True,
            "HelmDeploySucceeded",
            "deployed again",
        );
        let merged = upsert_condition(vec![first], update);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].last_transition_time, original_transition);
        assert_eq!(merged[0].message.as_deref(), Some("deployed again"));
    }

    /// A status flip moves the transition time forward
    #[test]
    fn upsert_advances_transition_time_on_flip() {
        let mut first = HelmReleaseCondition::new(
            HelmReleaseConditionType::Released,
            ConditionStatus::True,
            "HelmDeploySucceeded",
            "deployed",
        );
        first.last_transition_time =
            Some(Utc::now() - chrono::Duration::try_hours(1).unwrap());
        let old_transition = first.last_transition_time;

        let update = HelmReleaseCondition::new(
            HelmReleaseConditionType::Released,
            ConditionStatus::False,
            "HelmDeployFailed",
            "failed",
        );
        let merged = upsert_condition(vec![first], update);

        assert_eq!(merged.len(), 1);
        assert!(merged[0].last_transition_time > old_transition);
        assert_eq!(merged[0].status, ConditionStatus::False);
    }

    #[test]
    fn distinct_condition_types_accumulate() {
        let released = HelmReleaseCondition::new(
            HelmReleaseConditionType::Released,
            ConditionStatus::True,
            "HelmDeploySucceeded",
            "",
        );
        let tested = HelmReleaseCondition::new(
            HelmReleaseConditionType::Tested,
            ConditionStatus::True,
            "HelmTestSucceeded",
            "",
        );
        let merged = upsert_condition(vec![released], tested);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn phase_condition_mapping() {
        assert!(condition_for_phase(HelmReleasePhase::Deployed).is_some());
        assert!(condition_for_phase(HelmReleasePhase::RolledBack).is_some());
        assert!(condition_for_phase(HelmReleasePhase::Installing).is_none());
        assert!(condition_for_phase(HelmReleasePhase::ChartFetched).is_none());
    }
}
