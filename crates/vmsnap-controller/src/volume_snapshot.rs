//! Storage-engine snapshot objects, one per volume backup.
//!
//! The driver checks for each object before creating it, so repeated passes
//! never create twice. An object that was recorded in the content status and
//! has since vanished is reported as missing and is not recreated.

use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::error::{Result, SnapshotError};
use crate::ports::Ports;
use crate::types::{
    Event, EventType, ObjectKey, ObjectMeta, SnapshotContent, VolumeBackup, VolumeSnapshot,
    VolumeSnapshotRecord, SOURCE_VM_NAME_LABEL,
};

/// Event reason for a created volume snapshot.
pub const EVENT_VOLUME_SNAPSHOT_CREATED: &str = "SuccessfulVolumeSnapshotCreate";

/// Deterministic name of the snapshot object for one volume of a request.
pub fn volume_snapshot_name(request_uid: &str, volume_name: &str) -> String {
    format!("vmsnapshot-{}-volume-{}", request_uid, volume_name)
}

/// Labels stamped on every volume snapshot of `vm_name`.
pub fn volume_snapshot_labels(vm_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(SOURCE_VM_NAME_LABEL.to_string(), vm_name.to_string());
    labels
}

fn record_of(snapshot: &VolumeSnapshot) -> VolumeSnapshotRecord {
    let state = snapshot.status.clone().unwrap_or_default();
    VolumeSnapshotRecord {
        volume_snapshot_name: snapshot.meta.name.clone(),
        creation_time: state.creation_time,
        ready_to_use: state.ready_to_use,
        error: state.error,
    }
}

/// What the driver saw for one volume backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The object already existed.
    Present(VolumeSnapshotRecord),
    /// The object was created during this pass.
    Created(VolumeSnapshotRecord),
    /// The object was recorded earlier and is gone.
    Missing,
    /// The engine refused to create it.
    Rejected(String),
}

impl Observation {
    /// The object's record, if it exists.
    pub fn record(&self) -> Option<&VolumeSnapshotRecord> {
        match self {
            Observation::Present(r) | Observation::Created(r) => Some(r),
            _ => None,
        }
    }
}

/// Per-backup observations from one driver pass, in backup order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSnapshotReport {
    /// `(snapshot object name, observation)` pairs.
    pub entries: Vec<(String, Observation)>,
}

impl VolumeSnapshotReport {
    /// True if every object exists and the engine has cut it.
    pub fn all_created(&self) -> bool {
        self.entries
            .iter()
            .all(|(_, o)| o.record().map(|r| r.is_created()).unwrap_or(false))
    }

    /// Names of objects that went missing.
    pub fn missing(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, o)| matches!(o, Observation::Missing))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `(name, reason)` of rejected creates.
    pub fn rejected(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|(name, o)| match o {
                Observation::Rejected(reason) => Some((name.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of objects created in this pass.
    pub fn created_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, o)| matches!(o, Observation::Created(_)))
            .count()
    }

    /// Records of every existing object, in backup order.
    pub fn records(&self) -> Vec<VolumeSnapshotRecord> {
        self.entries
            .iter()
            .filter_map(|(_, o)| o.record().cloned())
            .collect()
    }
}

/// Creates and observes the snapshot objects behind a content artifact.
#[derive(Debug, Clone)]
pub struct VolumeSnapshotDriver {
    ports: Ports,
}

impl VolumeSnapshotDriver {
    /// Creates a driver over the given ports.
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Ensures an object exists for every backup, creating missing ones
    /// concurrently.
    pub async fn sync(&self, content: &SnapshotContent) -> Result<VolumeSnapshotReport> {
        let recorded: HashSet<&str> = content
            .status
            .iter()
            .flat_map(|s| s.volume_snapshot_status.iter())
            .map(|r| r.volume_snapshot_name.as_str())
            .collect();

        let results = join_all(content.spec.volume_backups.iter().map(|backup| {
            let was_recorded = recorded.contains(backup.volume_snapshot_name.as_str());
            self.sync_one(content, backup, was_recorded)
        }))
        .await;

        let mut report = VolumeSnapshotReport::default();
        for (backup, result) in content.spec.volume_backups.iter().zip(results) {
            report
                .entries
                .push((backup.volume_snapshot_name.clone(), result?));
        }
        Ok(report)
    }

    async fn sync_one(
        &self,
        content: &SnapshotContent,
        backup: &VolumeBackup,
        was_recorded: bool,
    ) -> Result<Observation> {
        let key = content.meta.key().sibling(backup.volume_snapshot_name.clone());
        if let Some(existing) = self.ports.volume_snapshots.get_volume_snapshot(&key).await? {
            return Ok(Observation::Present(record_of(&existing)));
        }
        if was_recorded {
            warn!(volume_snapshot = %key, "volume snapshot recorded in content is missing");
            return Ok(Observation::Missing);
        }

        let snapshot = VolumeSnapshot {
            meta: ObjectMeta {
                labels: volume_snapshot_labels(&content.spec.source.name),
                ..ObjectMeta::new(key.namespace.clone(), key.name.clone())
            },
            source_claim: backup.claim.name.clone(),
            owner_content: content.meta.name.clone(),
            status: None,
        };

        match self.ports.volume_snapshots.create_volume_snapshot(&snapshot).await {
            Ok(created) => {
                info!(
                    volume_snapshot = %key,
                    volume = %backup.volume_name,
                    claim = %backup.claim.name,
                    "created volume snapshot"
                );
                self.ports.events.record(Event {
                    object: content.meta.key().sibling(content.spec.request_name.clone()),
                    object_kind: "VirtualMachineSnapshot".to_string(),
                    event_type: EventType::Normal,
                    reason: EVENT_VOLUME_SNAPSHOT_CREATED.to_string(),
                    message: format!(
                        "Successfully created VolumeSnapshot {} for volume {}",
                        key.name, backup.volume_name
                    ),
                });
                Ok(Observation::Created(record_of(&created)))
            }
            Err(e) if e.is_already_exists() => {
                debug!(volume_snapshot = %key, "volume snapshot created concurrently");
                let existing = self.ports.volume_snapshots.get_volume_snapshot(&key).await?;
                Ok(existing
                    .map(|vs| Observation::Present(record_of(&vs)))
                    .unwrap_or(Observation::Missing))
            }
            Err(e @ SnapshotError::Rejected { .. }) => {
                warn!(volume_snapshot = %key, error = %e, "volume snapshot create rejected");
                Ok(Observation::Rejected(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes every snapshot object of the content; returns how many existed.
    pub async fn delete_all(&self, content: &SnapshotContent) -> Result<usize> {
        let mut deleted = 0;
        for backup in &content.spec.volume_backups {
            let key: ObjectKey = content.meta.key().sibling(backup.volume_snapshot_name.clone());
            if self.ports.volume_snapshots.delete_volume_snapshot(&key).await? {
                debug!(volume_snapshot = %key, "deleted volume snapshot");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
