//! Content materializer.
//!
//! Builds the immutable snapshot artifact from the source captured in the
//! lease plus one volume backup per included volume, and folds the storage
//! engine's per-volume state into the artifact's status.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{Result, SnapshotError};
use crate::ports::Ports;
use crate::selection::VolumeSelection;
use crate::types::{
    CapturedSource, ClaimCopy, ContentSpec, ContentStatus, Event, EventType, Indication,
    ObjectError, ObjectMeta, SnapshotContent, SnapshotRequest, VolumeBackup,
};
use crate::volume_snapshot::{volume_snapshot_name, VolumeSnapshotReport};

/// Event reason for a created content artifact.
pub const EVENT_CONTENT_CREATED: &str = "SuccessfulVirtualMachineSnapshotContentCreate";

const KIND_CONTENT: &str = "VirtualMachineSnapshotContent";

/// Deterministic content name for a request.
pub fn content_name(request_uid: &str) -> String {
    format!("vmsnapshot-content-{}", request_uid)
}

/// Builds, stores and aggregates content artifacts.
#[derive(Debug, Clone)]
pub struct ContentMaterializer {
    ports: Ports,
}

impl ContentMaterializer {
    /// Creates a materializer.
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Builds the artifact without storing it.
    ///
    /// Fails if an included claim is being deleted.
    pub fn build(
        request: &SnapshotRequest,
        captured: &CapturedSource,
        selection: &VolumeSelection,
        indications: &[Indication],
    ) -> Result<SnapshotContent> {
        let name = content_name(&request.meta.uid);
        let key = request.meta.key().sibling(name.clone());

        let mut volume_backups = Vec::with_capacity(selection.included.len());
        for selected in &selection.included {
            if selected.claim.meta.is_deleting() {
                return Err(SnapshotError::Rejected {
                    kind: KIND_CONTENT,
                    key,
                    reason: format!("PVC {} is being deleted", selected.claim.meta.key()),
                });
            }
            volume_backups.push(VolumeBackup {
                volume_name: selected.volume.name.clone(),
                claim: ClaimCopy {
                    name: selected.claim.meta.name.clone(),
                    spec: selected.claim.spec.clone(),
                },
                volume_snapshot_name: volume_snapshot_name(&request.meta.uid, &selected.volume.name),
            });
        }

        Ok(SnapshotContent {
            meta: ObjectMeta::new(request.meta.namespace.clone(), name),
            spec: ContentSpec {
                request_name: request.meta.name.clone(),
                source: captured.clone(),
                volume_backups,
                indications: indications.to_vec(),
                snapshot_volumes: selection.lists(),
            },
            status: None,
        })
    }

    /// Builds and stores the artifact. An artifact that already exists is
    /// returned as stored; its spec is never rewritten.
    pub async fn materialize(
        &self,
        request: &SnapshotRequest,
        captured: &CapturedSource,
        selection: &VolumeSelection,
        indications: &[Indication],
    ) -> Result<SnapshotContent> {
        let content = Self::build(request, captured, selection, indications)?;
        let key = content.meta.key();

        match self.ports.contents.create_content(&content).await {
            Ok(created) => {
                info!(
                    content = %key,
                    request = %request.meta.key(),
                    volumes = created.spec.volume_backups.len(),
                    "created snapshot content"
                );
                self.ports.events.record(Event {
                    object: request.meta.key(),
                    object_kind: "VirtualMachineSnapshot".to_string(),
                    event_type: EventType::Normal,
                    reason: EVENT_CONTENT_CREATED.to_string(),
                    message: format!(
                        "Successfully created VirtualMachineSnapshotContent {}",
                        key.name
                    ),
                });
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(content = %key, "snapshot content already exists");
                self.ports
                    .contents
                    .get_content(&key)
                    .await?
                    .ok_or_else(|| SnapshotError::not_found(KIND_CONTENT, &key))
            }
            Err(e) => Err(e),
        }
    }
}

/// Folds a driver report into a new content status.
///
/// Returns `None` while the artifact has no status and some volume snapshot
/// has not been created yet. Once every volume is captured, readiness
/// requires every snapshot ready and, for the first time, error-free; a
/// snapshot error seen after the artifact was ready does not revoke it. A
/// snapshot recorded earlier and now missing makes the artifact not ready
/// with a "missing" error.
pub fn aggregate_status(
    content: &SnapshotContent,
    report: &VolumeSnapshotReport,
    now: DateTime<Utc>,
) -> Option<ContentStatus> {
    let previous = content.status.as_ref();
    let missing = report.missing();

    if !missing.is_empty() {
        let mut status = previous.cloned().unwrap_or_default();
        let message = format!("VolumeSnapshots ({}) missing", missing.join(", "));
        let unchanged = status
            .error
            .as_ref()
            .and_then(|e| e.message.as_deref())
            .map(|m| m == message)
            .unwrap_or(false);
        if !unchanged {
            status.error = Some(ObjectError::new(message, Some(now)));
        }
        status.ready_to_use = Some(false);
        status.volume_snapshot_status = report
            .entries
            .iter()
            .filter_map(|(name, observation)| {
                observation.record().cloned().or_else(|| {
                    previous.and_then(|p| {
                        p.volume_snapshot_status
                            .iter()
                            .find(|r| &r.volume_snapshot_name == name)
                            .cloned()
                    })
                })
            })
            .collect();
        return Some(status);
    }

    if previous.is_none() && !report.all_created() {
        return None;
    }

    let records = report.records();
    let all_ready = records.len() == content.spec.volume_backups.len()
        && records.iter().all(|r| r.is_ready());
    let any_error = records.iter().any(|r| r.error.is_some());
    let was_ready = previous.and_then(|p| p.ready_to_use).unwrap_or(false);
    let creation_time = previous
        .and_then(|p| p.creation_time)
        .or_else(|| records.iter().filter_map(|r| r.creation_time).max())
        .or(Some(now));

    Some(ContentStatus {
        creation_time,
        ready_to_use: Some(all_ready && (!any_error || was_ready)),
        error: None,
        volume_snapshot_status: records,
    })
}
