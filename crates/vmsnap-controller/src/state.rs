//! Snapshot request state machine.
//!
//! [`Stage`] is the explicit state of a request; [`Stage::transition`] checks
//! every move against the transition table. [`Activity`] is what the
//! reconciler observed during one pass, and [`render`] turns a stage plus an
//! activity into the phase and ordered condition list written to status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapshotError};
use crate::types::{Condition, ConditionStatus, ConditionType};

/// Condition reason: the request is ready and finished.
pub const REASON_OPERATION_COMPLETE: &str = "Operation complete";
/// Condition reason: the request failed terminally.
pub const REASON_OPERATION_FAILED: &str = "Operation failed";
/// Condition reason: the snapshot cannot be restored from yet.
pub const REASON_NOT_READY: &str = "Not ready";
/// Condition reason: the lease is held and work is progressing.
pub const REASON_SOURCE_LOCKED: &str = "Source locked and operation in progress";
/// Condition reason: the last step reported an error.
pub const REASON_IN_ERROR: &str = "In error state";
/// Condition reason: the source VM does not exist.
pub const REASON_SOURCE_MISSING: &str = "Source does not exist";
/// Failure reason when the deadline elapses.
pub const REASON_DEADLINE_EXCEEDED: &str = "snapshot deadline exceeded";

/// Coarse lifecycle phase of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Not yet reconciled.
    #[default]
    Unknown,
    /// Being processed.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
}

impl Phase {
    /// True for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

/// Explicit state of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Request accepted, nothing done yet.
    #[default]
    NewRequest,
    /// Waiting for the source lease.
    SourceLocking,
    /// Lease held, freezing the guest.
    Freezing,
    /// Building the content artifact.
    ContentCreating,
    /// Volume snapshots in flight.
    VolumeSnapshotting,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
    /// Cleanup after a deletion request.
    Deleting,
}

impl Stage {
    /// True for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed)
    }

    /// Whether the transition table contains `self -> to`.
    pub fn can_transition(&self, to: Stage) -> bool {
        use Stage::*;
        if *self == to {
            return true;
        }
        match (*self, to) {
            (_, Deleting) => true,
            (Succeeded, _) | (Failed, _) | (Deleting, _) => false,
            (_, Failed) => true,
            (NewRequest, SourceLocking) => true,
            (SourceLocking | Freezing | ContentCreating, SourceLocking | Freezing | ContentCreating) => true,
            (ContentCreating, VolumeSnapshotting) => true,
            (VolumeSnapshotting, Succeeded) => true,
            _ => false,
        }
    }

    /// Returns `to` if the edge is legal.
    pub fn transition(self, to: Stage) -> Result<Stage> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(SnapshotError::IllegalTransition { from: self, to })
        }
    }
}

/// What the reconciler observed for a request during one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Activity {
    /// Blocked on a precondition; not progressing.
    Waiting {
        /// Human-readable reason.
        reason: String,
    },
    /// Lease held, work moving forward.
    Progressing,
    /// A step failed in a way that may clear on retry.
    Errored,
    /// Terminal success; `ready` mirrors the content readiness.
    Complete {
        /// Content readiness.
        ready: bool,
    },
    /// Terminal failure.
    Failed {
        /// Failure reason.
        reason: String,
    },
}

/// Renders the phase and ordered conditions for an activity.
///
/// `previous` supplies the existing conditions; a condition whose status and
/// reason are unchanged keeps its transition time.
pub fn render(
    activity: &Activity,
    previous: &[Condition],
    now: DateTime<Utc>,
) -> (Phase, Vec<Condition>) {
    use ConditionStatus::{False, True};
    use ConditionType::{Failure, Progressing, Ready};

    let (phase, specs): (Phase, Vec<(ConditionType, ConditionStatus, &str)>) = match activity {
        Activity::Waiting { reason } => (
            Phase::InProgress,
            vec![(Progressing, False, reason.as_str()), (Ready, False, REASON_NOT_READY)],
        ),
        Activity::Progressing => (
            Phase::InProgress,
            vec![(Progressing, True, REASON_SOURCE_LOCKED), (Ready, False, REASON_NOT_READY)],
        ),
        Activity::Errored => (
            Phase::InProgress,
            vec![(Progressing, False, REASON_IN_ERROR), (Ready, False, REASON_NOT_READY)],
        ),
        Activity::Complete { ready } => (
            Phase::Succeeded,
            vec![
                (Progressing, False, REASON_OPERATION_COMPLETE),
                if *ready {
                    (Ready, True, REASON_OPERATION_COMPLETE)
                } else {
                    (Ready, False, REASON_NOT_READY)
                },
            ],
        ),
        Activity::Failed { reason } => (
            Phase::Failed,
            vec![
                (Progressing, False, REASON_OPERATION_FAILED),
                (Ready, False, REASON_NOT_READY),
                (Failure, True, reason.as_str()),
            ],
        ),
    };

    let conditions = specs
        .into_iter()
        .map(|(kind, status, reason)| {
            let unchanged = previous
                .iter()
                .find(|c| c.kind == kind && c.status == status && c.reason == reason);
            Condition {
                kind,
                status,
                reason: reason.to_string(),
                last_transition_time: unchanged
                    .and_then(|c| c.last_transition_time)
                    .or(Some(now)),
            }
        })
        .collect();

    (phase, conditions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Stage; 8] = [
        Stage::NewRequest,
        Stage::SourceLocking,
        Stage::Freezing,
        Stage::ContentCreating,
        Stage::VolumeSnapshotting,
        Stage::Succeeded,
        Stage::Failed,
        Stage::Deleting,
    ];

    #[test]
    fn test_happy_path_edges() {
        let stage = Stage::NewRequest
            .transition(Stage::SourceLocking)
            .and_then(|s| s.transition(Stage::Freezing))
            .and_then(|s| s.transition(Stage::ContentCreating))
            .and_then(|s| s.transition(Stage::VolumeSnapshotting))
            .and_then(|s| s.transition(Stage::Succeeded))
            .unwrap();
        assert_eq!(stage, Stage::Succeeded);
    }

    #[test]
    fn test_terminal_stages_only_move_to_deleting() {
        for terminal in [Stage::Succeeded, Stage::Failed] {
            for to in ALL {
                let allowed = to == terminal || to == Stage::Deleting;
                assert_eq!(terminal.can_transition(to), allowed, "{:?} -> {:?}", terminal, to);
            }
        }
    }

    #[test]
    fn test_deleting_is_reachable_from_everywhere() {
        for from in ALL {
            assert!(from.can_transition(Stage::Deleting));
        }
        for to in ALL {
            assert_eq!(Stage::Deleting.can_transition(to), to == Stage::Deleting);
        }
    }

    #[test]
    fn test_cannot_skip_content_creation() {
        assert!(Stage::SourceLocking.transition(Stage::VolumeSnapshotting).is_err());
        assert!(Stage::NewRequest.transition(Stage::Succeeded).is_err());
        assert!(Stage::Freezing.transition(Stage::Succeeded).is_err());
        assert!(Stage::VolumeSnapshotting.transition(Stage::ContentCreating).is_err());
    }

    #[test]
    fn test_non_terminal_can_fail() {
        for from in [
            Stage::NewRequest,
            Stage::SourceLocking,
            Stage::Freezing,
            Stage::ContentCreating,
            Stage::VolumeSnapshotting,
        ] {
            assert!(from.can_transition(Stage::Failed));
        }
    }

    #[test]
    fn test_render_failed_order() {
        let now = Utc::now();
        let (phase, conds) = render(
            &Activity::Failed {
                reason: REASON_DEADLINE_EXCEEDED.to_string(),
            },
            &[],
            now,
        );
        assert_eq!(phase, Phase::Failed);
        let kinds: Vec<_> = conds.iter().map(|c| (c.kind, c.status, c.reason.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (ConditionType::Progressing, ConditionStatus::False, "Operation failed"),
                (ConditionType::Ready, ConditionStatus::False, "Not ready"),
                (ConditionType::Failure, ConditionStatus::True, "snapshot deadline exceeded"),
            ]
        );
    }

    #[test]
    fn test_render_never_ready_and_progressing() {
        let now = Utc::now();
        let activities = [
            Activity::Waiting {
                reason: REASON_SOURCE_MISSING.to_string(),
            },
            Activity::Progressing,
            Activity::Errored,
            Activity::Complete { ready: true },
            Activity::Complete { ready: false },
            Activity::Failed {
                reason: REASON_DEADLINE_EXCEEDED.to_string(),
            },
        ];
        for activity in &activities {
            let (_, conds) = render(activity, &[], now);
            let both = conds
                .iter()
                .filter(|c| {
                    matches!(c.kind, ConditionType::Ready | ConditionType::Progressing)
                        && c.status == ConditionStatus::True
                })
                .count();
            assert!(both <= 1, "{:?}", activity);
        }
    }

    #[test]
    fn test_render_preserves_transition_time() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let t1 = t0 + chrono::Duration::seconds(10);
        let (_, first) = render(&Activity::Progressing, &[], t0);
        let (_, second) = render(&Activity::Progressing, &first, t1);
        assert_eq!(second[0].last_transition_time, Some(t0));

        let (_, third) = render(&Activity::Complete { ready: true }, &second, t1);
        assert_eq!(third[0].last_transition_time, Some(t1));
        assert_eq!(third[1].status, ConditionStatus::True);
    }
}
