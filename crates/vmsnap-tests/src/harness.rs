//! Test Harness - in-memory cluster driven on a manual clock

use std::sync::{Arc, Once};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use vmsnap_controller::ports::SnapshotRequestStore;
use vmsnap_controller::{
    ClaimPhase, ClaimSpec, Controller, ControllerConfig, InMemoryCluster, InstancePhase,
    ManualClock, ObjectKey, ObjectMeta, PassReport, PersistentVolumeClaim, SnapshotContent,
    SnapshotRequest, SnapshotRequestStatus, VirtualMachine, VmInstance, Volume, VolumeSource,
};

/// Namespace every harness object lives in.
pub const NS: &str = "default";

/// Storage class with a volume snapshot class.
pub const SNAP_CLASS: &str = "csi-rbd";

/// Storage class without volume snapshot support.
pub const PLAIN_CLASS: &str = "local-path";

/// Data volume source backed by `claim`.
pub fn dv(name: &str, claim: &str) -> Volume {
    Volume::new(
        name,
        VolumeSource::DataVolume {
            name: claim.to_string(),
        },
    )
}

/// Plain claim source.
pub fn pvc(name: &str, claim: &str) -> Volume {
    Volume::new(
        name,
        VolumeSource::PersistentVolumeClaim {
            claim_name: claim.to_string(),
            hotpluggable: false,
        },
    )
}

static TRACING: Once = Once::new();

/// Routes controller logs to the test writer; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Object key in [`NS`].
pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NS, name)
}

#[derive(Debug)]
pub struct TestEnv {
    pub clock: Arc<ManualClock>,
    pub cluster: Arc<InMemoryCluster>,
    pub controller: Controller,
    pub config: ControllerConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::default());
        let cluster = Arc::new(InMemoryCluster::new(clock.clone()));
        cluster.put_storage_class(SNAP_CLASS, Some(format!("{}-snapclass", SNAP_CLASS)));
        cluster.put_storage_class(PLAIN_CLASS, None);
        let controller = Controller::new(cluster.ports(), config.clone());
        Self {
            clock,
            cluster,
            controller,
            config,
        }
    }

    pub fn claim(&self, name: &str, class: &str, phase: ClaimPhase) {
        self.cluster.put_claim(PersistentVolumeClaim {
            meta: ObjectMeta::new(NS, name),
            spec: ClaimSpec {
                storage_class: Some(class.to_string()),
                access_modes: vec!["ReadWriteOnce".to_string()],
                requested_bytes: 1 << 30,
                volume_name: Some(format!("pv-{}", name)),
                ..Default::default()
            },
            phase,
        });
    }

    pub fn bound_claim(&self, name: &str) {
        self.claim(name, SNAP_CLASS, ClaimPhase::Bound);
    }

    pub fn vm(&self, name: &str, volumes: Vec<Volume>) -> VirtualMachine {
        let mut vm = VirtualMachine {
            meta: ObjectMeta::new(NS, name),
            ..Default::default()
        };
        vm.spec.volumes = volumes;
        vm.spec.memory_request = "1Gi".to_string();
        self.cluster.put_vm(vm)
    }

    /// A halted VM with one snapshot-capable root disk.
    pub fn simple_vm(&self, name: &str) -> VirtualMachine {
        let claim = format!("{}-root", name);
        self.bound_claim(&claim);
        self.vm(name, vec![dv("rootdisk", &claim)])
    }

    pub fn start(&self, vm: &str, agent_connected: bool) {
        self.cluster.put_instance(VmInstance {
            meta: ObjectMeta::new(NS, vm),
            phase: InstancePhase::Running,
            agent_connected,
            ..Default::default()
        });
    }

    pub async fn request(&self, name: &str, source: &str) -> SnapshotRequest {
        self.cluster
            .create_request(&SnapshotRequest::new(NS, name, source))
            .await
            .expect("create request")
    }

    pub async fn request_with_deadline(
        &self,
        name: &str,
        source: &str,
        deadline: Duration,
    ) -> SnapshotRequest {
        let request = SnapshotRequest::new(NS, name, source).with_failure_deadline(deadline);
        self.cluster
            .create_request(&request)
            .await
            .expect("create request")
    }

    pub async fn delete_request(&self, name: &str) {
        self.cluster
            .delete_request(&key(name))
            .await
            .expect("delete request");
    }

    pub async fn pass(&self) -> PassReport {
        self.controller.run_once().await.expect("controller pass")
    }

    /// Runs `n` passes, advancing the clock one resync interval after each.
    pub async fn run_passes(&self, n: usize) -> PassReport {
        let mut last = PassReport::default();
        for _ in 0..n {
            last = self.pass().await;
            self.advance(self.config.resync_interval());
        }
        last
    }

    /// Runs passes until settled; returns the number of passes taken.
    pub async fn run_until_settled(&self, max: usize) -> usize {
        for step in 1..=max {
            let report = self.pass().await;
            tracing::debug!(step, ?report, "harness pass");
            if report.is_settled() {
                return step;
            }
            self.advance(self.config.resync_interval());
        }
        let statuses: Vec<_> = self
            .cluster
            .list_requests(None)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.meta.name, r.status))
            .collect();
        panic!(
            "not settled after {} passes: {}",
            max,
            serde_json::to_string_pretty(&statuses).unwrap_or_default()
        );
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn stored(&self, name: &str) -> Option<SnapshotRequest> {
        self.cluster.request(&key(name))
    }

    pub fn status(&self, name: &str) -> SnapshotRequestStatus {
        self.stored(name)
            .and_then(|r| r.status)
            .unwrap_or_default()
    }

    pub fn content_for(&self, name: &str) -> Option<SnapshotContent> {
        let content_name = self.status(name).content_name?;
        self.cluster.content(&key(&content_name))
    }

    pub fn lease_holder(&self, vm: &str) -> Option<String> {
        self.cluster
            .vm(&key(vm))
            .and_then(|vm| vm.status.source_lease)
            .map(|lease| lease.holder)
    }

    pub fn is_frozen(&self, vm: &str) -> bool {
        self.cluster
            .instance(&key(vm))
            .map(|i| i.is_frozen())
            .unwrap_or(false)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
