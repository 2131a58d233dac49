//! Status reconstruction from child objects.
//!
//! After a request's status is wiped, an equivalent status is rebuilt purely
//! from the content artifact, the source lease and the failure annotation. Nothing here issues guest
//! commands or creates objects, so recovery never repeats a side effect.

use chrono::{DateTime, Utc};

use crate::state::{render, Activity, Stage};
use crate::types::{SnapshotContent, SnapshotRequestStatus};

/// Rebuilds request status from a content artifact.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusReconstructor;

impl StatusReconstructor {
    /// Reconstructs the status of the request owning `content`.
    ///
    /// `holds_lease` tells whether the request still holds its source lease:
    /// a request releases the lease only after reaching a terminal phase,
    /// and a failed request never keeps its content, so an artifact with a
    /// status and no lease belongs to a succeeded request.
    pub fn reconstruct(
        content: &SnapshotContent,
        holds_lease: bool,
        now: DateTime<Utc>,
    ) -> SnapshotRequestStatus {
        let mut status = SnapshotRequestStatus {
            source_uid: Some(content.spec.source.uid.clone()),
            content_name: Some(content.meta.name.clone()),
            indications: content.spec.indications.clone(),
            snapshot_volumes: Some(content.spec.snapshot_volumes.clone()),
            error: content.status.as_ref().and_then(|s| s.error.clone()),
            ..Default::default()
        };

        let succeeded = !holds_lease && content.status.is_some();
        let activity = if succeeded {
            let ready = content.is_ready();
            status.stage = Stage::Succeeded;
            status.ready_to_use = Some(ready);
            status.creation_time = content.status.as_ref().and_then(|s| s.creation_time);
            Activity::Complete { ready }
        } else {
            status.stage = Stage::VolumeSnapshotting;
            status.ready_to_use = Some(false);
            Activity::Progressing
        };

        let (phase, conditions) = render(&activity, &[], now);
        status.phase = phase;
        status.conditions = conditions;
        status
    }

    /// Reconstructs the status of a request that failed with `reason`.
    pub fn reconstruct_failed(reason: &str, now: DateTime<Utc>) -> SnapshotRequestStatus {
        let activity = Activity::Failed {
            reason: reason.to_string(),
        };
        let (phase, conditions) = render(&activity, &[], now);
        SnapshotRequestStatus {
            phase,
            stage: Stage::Failed,
            conditions,
            ready_to_use: Some(false),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;
    use crate::types::{
        CapturedSource, ConditionStatus, ConditionType, ContentSpec, ContentStatus, Indication,
        ObjectMeta, SnapshotVolumeLists, VmSpec,
    };

    fn content(status: Option<ContentStatus>) -> SnapshotContent {
        SnapshotContent {
            meta: ObjectMeta::new("default", "vmsnapshot-content-uid1"),
            spec: ContentSpec {
                request_name: "snap".to_string(),
                source: CapturedSource {
                    name: "vm".to_string(),
                    namespace: "default".to_string(),
                    uid: "vm-uid".to_string(),
                    generation: 1,
                    labels: Default::default(),
                    spec: VmSpec::default(),
                },
                volume_backups: vec![],
                indications: vec![Indication::GuestAgent, Indication::Online],
                snapshot_volumes: SnapshotVolumeLists {
                    included: vec!["rootdisk".to_string()],
                    excluded: vec![],
                },
            },
            status,
        }
    }

    #[test]
    fn test_succeeded_from_ready_content() {
        let created = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(30);
        let c = content(Some(ContentStatus {
            creation_time: Some(created),
            ready_to_use: Some(true),
            ..Default::default()
        }));
        let status = StatusReconstructor::reconstruct(&c, false, Utc::now());
        assert_eq!(status.phase, Phase::Succeeded);
        assert_eq!(status.stage, Stage::Succeeded);
        assert_eq!(status.creation_time, Some(created));
        assert_eq!(status.ready_to_use, Some(true));
        assert_eq!(status.source_uid.as_deref(), Some("vm-uid"));
        assert_eq!(status.indications, vec![Indication::GuestAgent, Indication::Online]);
        assert!(status.condition_is_true(ConditionType::Ready));
    }

    #[test]
    fn test_failed_from_reason() {
        let status = StatusReconstructor::reconstruct_failed("snapshot deadline exceeded", Utc::now());
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.stage, Stage::Failed);
        assert_eq!(status.ready_to_use, Some(false));
        assert!(status.content_name.is_none());
        let failure = status.condition(ConditionType::Failure).unwrap();
        assert_eq!(failure.status, ConditionStatus::True);
        assert_eq!(failure.reason, "snapshot deadline exceeded");
    }

    #[test]
    fn test_in_progress_while_lease_held() {
        let c = content(None);
        let status = StatusReconstructor::reconstruct(&c, true, Utc::now());
        assert_eq!(status.phase, Phase::InProgress);
        assert_eq!(status.stage, Stage::VolumeSnapshotting);
        assert!(status.creation_time.is_none());
        let progressing = status.condition(ConditionType::Progressing).unwrap();
        assert_eq!(progressing.status, ConditionStatus::True);
    }
}
