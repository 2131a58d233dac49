//! Scripted runs against the in-memory cluster.
//!
//! A scenario file seeds VMs, instances, claims, storage classes and
//! snapshot requests, optionally injects faults, and is then driven by the
//! controller on a manual clock that advances one resync interval per pass.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{Clock, ManualClock};
use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::{Result, SnapshotError};
use crate::memory::InMemoryCluster;
use crate::ports::SnapshotRequestStore;
use crate::state::{Phase, Stage};
use crate::types::{
    Event, PersistentVolumeClaim, SnapshotRequest, VirtualMachine, VmInstance,
};

/// A storage class and the snapshot class configured for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageClassEntry {
    /// Storage class name.
    pub name: String,
    /// Matching volume snapshot class, if any.
    pub snapshot_class: Option<String>,
}

/// A snapshot request to create at the start of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestEntry {
    /// Namespace of the request and its source.
    pub namespace: String,
    /// Request name.
    pub name: String,
    /// Source VM name.
    pub source: String,
    /// Failure deadline in seconds; `0` disables it.
    pub failure_deadline_secs: Option<u64>,
}

impl RequestEntry {
    fn to_request(&self) -> SnapshotRequest {
        let namespace = if self.namespace.is_empty() {
            "default"
        } else {
            self.namespace.as_str()
        };
        let request = SnapshotRequest::new(namespace, self.name.clone(), self.source.clone());
        match self.failure_deadline_secs {
            Some(secs) => request.with_failure_deadline(Duration::from_secs(secs)),
            None => request,
        }
    }
}

/// Faults injected into the cluster before the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FaultEntry {
    /// VMs whose volume snapshot creation the storage layer rejects.
    pub deny_volume_snapshots_for: Vec<String>,
    /// Message returned by every guest freeze.
    pub freeze_failure: Option<String>,
    /// Guest agent cannot be reached.
    pub guest_unreachable: bool,
    /// Whether new volume snapshots report ready immediately.
    pub volume_snapshots_ready: bool,
}

impl Default for FaultEntry {
    fn default() -> Self {
        Self {
            deny_volume_snapshots_for: Vec::new(),
            freeze_failure: None,
            guest_unreachable: false,
            volume_snapshots_ready: true,
        }
    }
}

/// A complete scenario document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Scenario {
    /// VMs to seed.
    pub vms: Vec<VirtualMachine>,
    /// Running instances to seed.
    pub instances: Vec<VmInstance>,
    /// Claims to seed.
    pub claims: Vec<PersistentVolumeClaim>,
    /// Storage classes to seed.
    pub storage_classes: Vec<StorageClassEntry>,
    /// Requests created before the first pass.
    pub requests: Vec<RequestEntry>,
    /// Injected faults.
    pub faults: FaultEntry,
}

impl Scenario {
    /// Reads a scenario from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let scenario: Scenario = serde_json::from_str(&content)?;
        if scenario.requests.iter().any(|r| r.name.is_empty() || r.source.is_empty()) {
            return Err(SnapshotError::Config(
                "every request needs a name and a source".to_string(),
            ));
        }
        Ok(scenario)
    }

    /// Seeds a fresh cluster on `clock` with this scenario's objects.
    pub async fn load(&self, clock: Arc<dyn Clock>) -> Result<Arc<InMemoryCluster>> {
        let cluster = Arc::new(InMemoryCluster::new(clock));
        for class in &self.storage_classes {
            cluster.put_storage_class(class.name.clone(), class.snapshot_class.clone());
        }
        for claim in &self.claims {
            cluster.put_claim(claim.clone());
        }
        for vm in &self.vms {
            cluster.put_vm(vm.clone());
        }
        for instance in &self.instances {
            cluster.put_instance(instance.clone());
        }
        for vm in &self.faults.deny_volume_snapshots_for {
            cluster.deny_volume_snapshots_for(vm.clone());
        }
        cluster.set_freeze_failure(self.faults.freeze_failure.clone());
        cluster.set_guest_unreachable(self.faults.guest_unreachable);
        cluster.set_auto_ready(self.faults.volume_snapshots_ready);

        for entry in &self.requests {
            cluster.create_request(&entry.to_request()).await?;
        }
        Ok(cluster)
    }
}

/// Final state of one request after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    /// Request name.
    pub name: String,
    /// Final phase.
    pub phase: Phase,
    /// Final stage.
    pub stage: Stage,
    /// Final readiness.
    pub ready_to_use: bool,
    /// Content artifact name.
    pub content_name: Option<String>,
    /// Last error message.
    pub error: Option<String>,
    /// Volumes included in the snapshot.
    pub included: Vec<String>,
    /// Volumes excluded from the snapshot.
    pub excluded: Vec<String>,
}

impl RequestSummary {
    fn of(request: &SnapshotRequest) -> Self {
        let status = request.status.clone().unwrap_or_default();
        let volumes = status.snapshot_volumes.unwrap_or_default();
        Self {
            name: request.meta.name.clone(),
            phase: status.phase,
            stage: status.stage,
            ready_to_use: status.ready_to_use.unwrap_or(false),
            content_name: status.content_name,
            error: status.error.and_then(|e| e.message),
            included: volumes.included,
            excluded: volumes.excluded,
        }
    }
}

/// Outcome of a scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    /// Passes executed.
    pub steps: usize,
    /// Whether every request reached a terminal phase.
    pub settled: bool,
    /// Per-request results, sorted by name.
    pub requests: Vec<RequestSummary>,
    /// Events recorded during the run.
    pub events: Vec<Event>,
}

/// Runs `scenario` until every request is terminal or `max_steps` passes.
pub async fn run(
    scenario: &Scenario,
    config: ControllerConfig,
    max_steps: usize,
) -> Result<ScenarioReport> {
    let clock = Arc::new(ManualClock::default());
    let cluster = scenario.load(clock.clone()).await?;
    let resync = config.resync_interval();
    let controller = Controller::new(cluster.ports(), config);

    let mut steps = 0;
    let mut settled = false;
    while steps < max_steps {
        let report = controller.run_once().await?;
        steps += 1;
        debug!(step = steps, ?report, "scenario pass");
        if report.is_settled() {
            settled = true;
            break;
        }
        clock.advance(resync);
    }
    info!(steps, settled, "scenario finished");

    let mut requests: Vec<RequestSummary> = cluster
        .list_requests(None)
        .await?
        .iter()
        .map(RequestSummary::of)
        .collect();
    requests.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ScenarioReport {
        steps,
        settled,
        requests,
        events: cluster.events(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCENARIO: &str = r#"{
        "storageClasses": [{"name": "csi", "snapshotClass": "csi-snap"}],
        "claims": [
            {"meta": {"namespace": "default", "name": "root"},
             "spec": {"storage_class": "csi"}, "phase": "Bound"}
        ],
        "vms": [
            {"meta": {"namespace": "default", "name": "vm"},
             "spec": {"volumes": [
                {"name": "rootdisk", "source": {"dataVolume": {"name": "root"}}},
                {"name": "cloudinit", "source": {"cloudInitNoCloud": {"user_data": ""}}}
             ]}}
        ],
        "requests": [{"namespace": "default", "name": "snap", "source": "vm"}]
    }"#;

    #[tokio::test]
    async fn test_scenario_runs_to_success() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let report = run(&scenario, ControllerConfig::default(), 10).await.unwrap();
        assert!(report.settled);
        assert_eq!(report.requests.len(), 1);
        let snap = &report.requests[0];
        assert_eq!(snap.phase, Phase::Succeeded);
        assert!(snap.ready_to_use);
        assert_eq!(snap.included, vec!["rootdisk".to_string()]);
        assert_eq!(snap.excluded, vec!["cloudinit".to_string()]);
    }

    #[tokio::test]
    async fn test_unready_volume_snapshots_hit_deadline() {
        let mut scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        scenario.faults.volume_snapshots_ready = false;
        scenario.requests[0].failure_deadline_secs = Some(3);
        let report = run(&scenario, ControllerConfig::default(), 10).await.unwrap();
        assert!(report.settled);
        let snap = &report.requests[0];
        assert_eq!(snap.phase, Phase::Failed);
        assert!(snap.content_name.is_none());
        assert!(report.steps <= 5);
    }

    #[test]
    fn test_from_file_rejects_nameless_request() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(br#"{"requests": [{"name": "", "source": "vm"}]}"#)
            .unwrap();
        let err = Scenario::from_file(file.path()).unwrap_err();
        assert!(matches!(err, SnapshotError::Config(_)));
    }
}
