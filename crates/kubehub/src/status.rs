//! Release status read and write-back through the Release custom resource.

use anyhow::{Context, Result};
use appdeck_core::{states, Kind, ReleaseId};
use appdeck_reconcile::{Outcome, PollError, ReleasePhase, ReleaseStatusProvider, StatusSink};
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tracing::debug;

use crate::{find_api_resource, scoped_api};

/// Map a release's `status.state` onto a poll result.
pub fn phase_from_state(state: &str, message: Option<&str>) -> ReleasePhase {
    match state {
        states::ACTIVE | states::CREATED | states::UPGRADED => ReleasePhase::Ready,
        states::FAILED => ReleasePhase::Failed(message.unwrap_or(states::FAILED).to_string()),
        _ => ReleasePhase::Pending,
    }
}

/// Merge patch body written on a terminal outcome.
pub fn status_patch(outcome: &Outcome) -> serde_json::Value {
    match outcome {
        Outcome::Succeeded => serde_json::json!({ "status": { "state": states::ACTIVE, "message": "" } }),
        Outcome::Failed(reason) => serde_json::json!({ "status": { "state": states::FAILED, "message": reason } }),
    }
}

#[derive(Clone)]
struct ReleaseApi {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl ReleaseApi {
    async fn discover(client: Client) -> Result<Self> {
        let (ar, namespaced) = find_api_resource(client.clone(), Kind::Release).await?;
        Ok(Self { client, ar, namespaced })
    }

    fn api(&self, id: &ReleaseId) -> Api<DynamicObject> {
        scoped_api(self.client.clone(), &self.ar, self.namespaced, id.namespace.as_deref())
    }
}

/// Reads `status.state` (and `status.message`) of the Release resource.
#[derive(Clone)]
pub struct KubeReleaseStatus {
    releases: ReleaseApi,
}

impl KubeReleaseStatus {
    pub async fn new(client: Client) -> Result<Self> { Ok(Self { releases: ReleaseApi::discover(client).await? }) }
}

#[async_trait::async_trait]
impl ReleaseStatusProvider for KubeReleaseStatus {
    async fn fetch(&self, id: &ReleaseId) -> Result<ReleasePhase, PollError> {
        let obj = self
            .releases
            .api(id)
            .get_opt(&id.name)
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?
            .ok_or_else(|| PollError::NotFound(id.to_string()))?;
        let state = obj.data.pointer("/status/state").and_then(|v| v.as_str()).unwrap_or("");
        let message = obj.data.pointer("/status/message").and_then(|v| v.as_str());
        debug!(release = %id, state, "status fetched");
        Ok(phase_from_state(state, message))
    }
}

/// Writes terminal outcomes back to the Release status subresource.
#[derive(Clone)]
pub struct KubeStatusSink {
    releases: ReleaseApi,
}

impl KubeStatusSink {
    pub async fn new(client: Client) -> Result<Self> { Ok(Self { releases: ReleaseApi::discover(client).await? }) }
}

#[async_trait::async_trait]
impl StatusSink for KubeStatusSink {
    async fn report(&self, id: &ReleaseId, outcome: &Outcome) -> Result<()> {
        let patch = status_patch(outcome);
        let pp = PatchParams::default();
        let _ = self
            .releases
            .api(id)
            .patch_status(&id.name, &pp, &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching status of release {}", id))?;
        debug!(release = %id, outcome = ?outcome, "status patched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_states_are_terminal() {
        for s in ["active", "created", "upgraded"] {
            assert_eq!(phase_from_state(s, None), ReleasePhase::Ready);
        }
        assert_eq!(phase_from_state("failed", Some("chart not found")), ReleasePhase::Failed("chart not found".into()));
        assert_eq!(phase_from_state("failed", None), ReleasePhase::Failed("failed".into()));
        for s in ["", "creating", "upgrading", "deleting"] {
            assert_eq!(phase_from_state(s, None), ReleasePhase::Pending);
        }
    }

    #[test]
    fn patch_carries_state_and_message() {
        let p = status_patch(&Outcome::Failed("boom".into()));
        assert_eq!(p["status"]["state"], "failed");
        assert_eq!(p["status"]["message"], "boom");
        assert_eq!(status_patch(&Outcome::Succeeded)["status"]["state"], "active");
    }
}
