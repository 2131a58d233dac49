//! Polling work loop.
//!
//! Each pass lists every snapshot request and reconciles them with bounded
//! concurrency, then refreshes the per-volume snapshot eligibility reported
//! on every VM. Errors from one request are logged and retried on the next
//! pass; they never stop the loop.

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::ports::Ports;
use crate::reconciler::Reconciler;
use crate::retry::retry_on_conflict;
use crate::state::Phase;
use crate::types::ObjectKey;

/// Counts from one controller pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Requests reconciled without error.
    pub reconciled: usize,
    /// Requests whose reconciliation returned an error.
    pub errors: usize,
    /// Requests still in progress after the pass.
    pub in_progress: usize,
    /// Requests in phase `Succeeded`.
    pub succeeded: usize,
    /// Requests in phase `Failed`.
    pub failed: usize,
    /// VMs whose volume snapshot statuses were rewritten.
    pub vm_status_updates: usize,
}

impl PassReport {
    /// True when no request is left in progress and none errored.
    pub fn is_settled(&self) -> bool {
        self.in_progress == 0 && self.errors == 0
    }
}

/// Drives the reconciler over all requests.
#[derive(Debug, Clone)]
pub struct Controller {
    ports: Ports,
    reconciler: Reconciler,
    config: ControllerConfig,
}

impl Controller {
    /// Creates a controller.
    pub fn new(ports: Ports, config: ControllerConfig) -> Self {
        let reconciler = Reconciler::new(ports.clone(), &config);
        Self {
            ports,
            reconciler,
            config,
        }
    }

    /// The reconciler.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Effective configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Runs one pass over every request and VM.
    pub async fn run_once(&self) -> Result<PassReport> {
        let requests = self.ports.requests.list_requests(None).await?;
        let keys: Vec<ObjectKey> = requests.iter().map(|r| r.meta.key()).collect();

        let results: Vec<_> = stream::iter(keys)
            .map(|key| async move {
                let result = self.reconciler.reconcile(&key).await;
                (key, result)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut report = PassReport::default();
        for (key, result) in results {
            match result {
                Ok(outcome) => {
                    report.reconciled += 1;
                    match outcome.phase {
                        Some(Phase::Succeeded) => report.succeeded += 1,
                        Some(Phase::Failed) => report.failed += 1,
                        Some(_) => report.in_progress += 1,
                        None => {}
                    }
                }
                Err(e) => {
                    warn!(request = %key, error = %e, "reconcile failed, will retry");
                    report.errors += 1;
                }
            }
        }

        report.vm_status_updates = self.refresh_vm_statuses().await?;
        debug!(?report, "controller pass complete");
        Ok(report)
    }

    /// Rewrites each VM's volume snapshot statuses where they changed.
    pub async fn refresh_vm_statuses(&self) -> Result<usize> {
        let mut updated = 0;
        for vm in self.ports.vms.list_vms(None).await? {
            let key = vm.meta.key();
            let instance = self.ports.vms.get_instance(&key).await?;
            let selection = self.reconciler.selector().select(&vm, instance.as_ref()).await?;
            if vm.status.volume_snapshot_statuses == selection.statuses {
                continue;
            }
            let (key_ref, statuses) = (&key, &selection.statuses);
            retry_on_conflict(&self.config.retry_config(), move || async move {
                let Some(mut latest) = self.ports.vms.get_vm(key_ref).await? else {
                    return Ok(());
                };
                latest.status.volume_snapshot_statuses = statuses.clone();
                self.ports.vms.update_vm(&latest).await.map(|_| ())
            })
            .await?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Runs passes every resync interval until `shutdown` flips to true or
    /// its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.resync_interval());
        info!(
            resync_ms = self.config.resync_interval_ms,
            workers = self.config.workers,
            "snapshot controller started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "controller pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("snapshot controller shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryCluster;
    use crate::ports::SnapshotRequestStore;
    use crate::types::{
        ClaimPhase, ClaimSpec, ObjectMeta, PersistentVolumeClaim, SnapshotRequest,
        VirtualMachine, Volume, VolumeSource,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn seed(cluster: &InMemoryCluster) {
        cluster.put_storage_class("csi", Some("csi-snap".to_string()));
        cluster.put_claim(PersistentVolumeClaim {
            meta: ObjectMeta::new("default", "root"),
            spec: ClaimSpec {
                storage_class: Some("csi".to_string()),
                ..Default::default()
            },
            phase: ClaimPhase::Bound,
        });
        let mut vm = VirtualMachine {
            meta: ObjectMeta::new("default", "vm"),
            ..Default::default()
        };
        vm.spec.volumes = vec![
            Volume::new("rootdisk", VolumeSource::DataVolume { name: "root".into() }),
            Volume::new("cd", VolumeSource::ContainerDisk { image: "img".into() }),
        ];
        cluster.put_vm(vm);
    }

    #[tokio::test]
    async fn test_run_once_settles_request_and_vm_statuses() {
        let cluster = Arc::new(InMemoryCluster::new(Arc::new(ManualClock::default())));
        seed(&cluster);
        cluster
            .create_request(&SnapshotRequest::new("default", "snap", "vm"))
            .await
            .unwrap();
        let controller = Controller::new(cluster.ports(), ControllerConfig::default());

        let report = controller.run_once().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(report.is_settled());
        assert_eq!(report.vm_status_updates, 1);

        let vm = cluster.vm(&ObjectKey::new("default", "vm")).unwrap();
        let enabled: Vec<_> = vm
            .status
            .volume_snapshot_statuses
            .iter()
            .map(|s| (s.name.as_str(), s.enabled))
            .collect();
        assert_eq!(enabled, vec![("rootdisk", true), ("cd", false)]);

        let again = controller.run_once().await.unwrap();
        assert_eq!(again.vm_status_updates, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let cluster = Arc::new(InMemoryCluster::default());
        let config = ControllerConfig {
            resync_interval_ms: 5,
            ..Default::default()
        };
        let controller = Controller::new(cluster.ports(), config);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { controller.run(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
