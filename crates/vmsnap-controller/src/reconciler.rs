//! Snapshot request reconciler.
//!
//! One call to [`Reconciler::reconcile`] observes a request and its children
//! and moves it as far along the state machine as the world allows. Every
//! step checks before acting, so a pass over an unchanged request issues no
//! side effects, and a pass after a crash resumes where the last one stopped.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::content::{aggregate_status, content_name, ContentMaterializer};
use crate::deadline::FailureDeadline;
use crate::error::{Result, SnapshotError};
use crate::freeze::{indications_for, FreezeCoordinator, FreezeOutcome};
use crate::lock::{BlockReason, LockOutcome, SourceLockManager};
use crate::ports::Ports;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::selection::VolumeSelector;
use crate::state::{render, Activity, Phase, Stage, REASON_DEADLINE_EXCEEDED};
use crate::status::StatusReconstructor;
use crate::types::{
    CapturedSource, ConditionType, Event, EventType, ObjectError, ObjectKey, ObjectMeta, SnapshotContent,
    SnapshotRequest, SnapshotRequestStatus, SourceLease, VirtualMachine, VmInstance,
    FAILURE_REASON_ANNOTATION, REQUEST_CLEANUP_FINALIZER,
};
use crate::volume_snapshot::VolumeSnapshotDriver;

/// Event reason for a failed freeze command.
pub const EVENT_FREEZE_ERROR: &str = "FreezeError";
/// Event reason for a request that failed terminally.
pub const EVENT_SNAPSHOT_FAILED: &str = "SnapshotFailed";

const KIND_REQUEST: &str = "VirtualMachineSnapshot";

/// Canonical forward path through the state machine.
const FORWARD_PATH: [Stage; 6] = [
    Stage::NewRequest,
    Stage::SourceLocking,
    Stage::Freezing,
    Stage::ContentCreating,
    Stage::VolumeSnapshotting,
    Stage::Succeeded,
];

/// What the controller should do with a request after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Phase after the pass; `None` once the request is gone.
    pub phase: Option<Phase>,
    /// When to look at the request again; `None` if never.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn gone() -> Self {
        Self {
            phase: None,
            requeue_after: None,
        }
    }
}

/// Moves `stage` forward to `target` along the canonical path, checking
/// every edge against the transition table.
fn advance(stage: &mut Stage, target: Stage) -> Result<()> {
    let from = FORWARD_PATH.iter().position(|s| *s == *stage);
    let to = FORWARD_PATH.iter().position(|s| *s == target);
    match (from, to) {
        (Some(from), Some(to)) if from < to => {
            for next in &FORWARD_PATH[from + 1..=to] {
                *stage = stage.transition(*next)?;
            }
            Ok(())
        }
        _ => {
            *stage = stage.transition(target)?;
            Ok(())
        }
    }
}

fn set_error(status: &mut SnapshotRequestStatus, message: Option<String>, now: DateTime<Utc>) {
    let unchanged = status.error.as_ref().and_then(|e| e.message.as_ref()) == message.as_ref();
    if !unchanged {
        status.error = message.map(|m| ObjectError::new(m, Some(now)));
    }
}

fn apply(status: &mut SnapshotRequestStatus, activity: &Activity, now: DateTime<Utc>) {
    let (phase, conditions) = render(activity, &status.conditions, now);
    status.phase = phase;
    status.conditions = conditions;
}

fn captured_view(captured: &CapturedSource, current: &VirtualMachine) -> VirtualMachine {
    VirtualMachine {
        meta: ObjectMeta {
            name: captured.name.clone(),
            namespace: captured.namespace.clone(),
            uid: captured.uid.clone(),
            generation: captured.generation,
            labels: captured.labels.clone(),
            ..current.meta.clone()
        },
        spec: captured.spec.clone(),
        status: current.status.clone(),
    }
}

/// Drives snapshot requests through their lifecycle.
#[derive(Debug, Clone)]
pub struct Reconciler {
    ports: Ports,
    selector: VolumeSelector,
    driver: VolumeSnapshotDriver,
    locks: SourceLockManager,
    freezer: FreezeCoordinator,
    materializer: ContentMaterializer,
    retry: RetryConfig,
    default_deadline: Duration,
    resync: Duration,
}

impl Reconciler {
    /// Creates a reconciler over `ports`.
    pub fn new(ports: Ports, config: &ControllerConfig) -> Self {
        let retry = config.retry_config();
        Self {
            selector: VolumeSelector::new(ports.clone()),
            driver: VolumeSnapshotDriver::new(ports.clone()),
            locks: SourceLockManager::new(ports.clone(), retry.clone()),
            freezer: FreezeCoordinator::new(ports.clone()),
            materializer: ContentMaterializer::new(ports.clone()),
            retry,
            default_deadline: config.default_failure_deadline(),
            resync: config.resync_interval(),
            ports,
        }
    }

    /// The volume selector used by this reconciler.
    pub fn selector(&self) -> &VolumeSelector {
        &self.selector
    }

    /// Runs one reconciliation pass for the request at `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(request) = self.ports.requests.get_request(key).await? else {
            debug!(request = %key, "request gone");
            return Ok(ReconcileOutcome::gone());
        };

        if request.meta.is_deleting() {
            return self.finalize_deletion(request).await;
        }

        let Some(request) = self.ensure_finalizer(request).await? else {
            return Ok(ReconcileOutcome::gone());
        };

        let status = match request.status.clone() {
            Some(status) => status,
            None => self.recover_status(&request).await?,
        };

        match status.phase {
            Phase::Succeeded => self.track_succeeded(request, status).await,
            Phase::Failed => self.settle_failed(request, status).await,
            Phase::Unknown | Phase::InProgress => self.drive(request, status).await,
        }
    }

    fn requeue(&self, phase: Phase) -> ReconcileOutcome {
        ReconcileOutcome {
            phase: Some(phase),
            requeue_after: Some(self.resync),
        }
    }

    fn content_key(request: &SnapshotRequest) -> ObjectKey {
        request.meta.key().sibling(content_name(&request.meta.uid))
    }

    fn record_event(&self, request: &SnapshotRequest, event_type: EventType, reason: &str, message: String) {
        self.ports.events.record(Event {
            object: request.meta.key(),
            object_kind: KIND_REQUEST.to_string(),
            event_type,
            reason: reason.to_string(),
            message,
        });
    }

    async fn ensure_finalizer(&self, request: SnapshotRequest) -> Result<Option<SnapshotRequest>> {
        if request.meta.has_finalizer(REQUEST_CLEANUP_FINALIZER) {
            return Ok(Some(request));
        }
        let key = request.meta.key();
        let key = &key;
        retry_on_conflict(&self.retry, move || async move {
            let Some(mut latest) = self.ports.requests.get_request(key).await? else {
                return Ok(None);
            };
            if !latest.meta.add_finalizer(REQUEST_CLEANUP_FINALIZER) {
                return Ok(Some(latest));
            }
            self.ports.requests.update_request(&latest).await
        })
        .await
    }

    async fn recover_status(&self, request: &SnapshotRequest) -> Result<SnapshotRequestStatus> {
        if let Some(reason) = request.meta.annotations.get(FAILURE_REASON_ANNOTATION) {
            info!(request = %request.meta.key(), reason = %reason, "reconstructing wiped failed status");
            return Ok(StatusReconstructor::reconstruct_failed(
                reason,
                self.ports.clock.now(),
            ));
        }
        let content = self
            .ports
            .contents
            .get_content(&Self::content_key(request))
            .await?;
        match content {
            Some(content) => {
                let holds = self.locks.holds(request).await?;
                info!(
                    request = %request.meta.key(),
                    content = %content.meta.name,
                    "reconstructing wiped status from content"
                );
                Ok(StatusReconstructor::reconstruct(
                    &content,
                    holds,
                    self.ports.clock.now(),
                ))
            }
            None => Ok(SnapshotRequestStatus::default()),
        }
    }

    /// Writes `status` unless it equals what is stored.
    async fn write_status(
        &self,
        request: &SnapshotRequest,
        status: SnapshotRequestStatus,
    ) -> Result<SnapshotRequest> {
        if request.status.as_ref() == Some(&status) {
            return Ok(request.clone());
        }
        let key = request.meta.key();
        let (key, status) = (&key, &status);
        retry_on_conflict(&self.retry, move || async move {
            let mut latest = self
                .ports
                .requests
                .get_request(key)
                .await?
                .ok_or_else(|| SnapshotError::not_found(KIND_REQUEST, key))?;
            latest.status = Some(status.clone());
            self.ports.requests.update_request_status(&latest).await
        })
        .await
    }

    async fn update_content_status(&self, content: &SnapshotContent) -> Result<SnapshotContent> {
        let key = content.meta.key();
        let key = &key;
        retry_on_conflict(&self.retry, move || async move {
            let mut latest = self
                .ports
                .contents
                .get_content(key)
                .await?
                .ok_or_else(|| SnapshotError::not_found("VirtualMachineSnapshotContent", key))?;
            latest.status = content.status.clone();
            self.ports.contents.update_content_status(&latest).await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // In-progress requests
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        request: SnapshotRequest,
        mut status: SnapshotRequestStatus,
    ) -> Result<ReconcileOutcome> {
        let now = self.ports.clock.now();
        let key = request.meta.key();

        let created = request.meta.creation_timestamp.unwrap_or(now);
        let deadline =
            FailureDeadline::resolve(created, request.spec.failure_deadline, self.default_deadline);
        if deadline.map(|d| d.is_expired(now)).unwrap_or(false) {
            warn!(request = %key, "snapshot deadline exceeded");
            return self.fail(request, status, REASON_DEADLINE_EXCEEDED).await;
        }

        let source = request.source_key();
        let Some(vm) = self.ports.vms.get_vm(&source).await? else {
            return self.wait(request, status, BlockReason::SourceMissing).await;
        };
        status.source_uid = Some(vm.meta.uid.clone());

        let instance = self.ports.vms.get_instance(&source).await?;
        let content_key = Self::content_key(&request);
        let existing = self.ports.contents.get_content(&content_key).await?;

        let held = vm
            .status
            .source_lease
            .as_ref()
            .filter(|lease| lease.holder_uid == request.meta.uid)
            .cloned();
        let lease = match held {
            Some(lease) => lease,
            None => {
                let unbound = match existing {
                    Some(_) => None,
                    None => self
                        .selector
                        .select(&vm, instance.as_ref())
                        .await?
                        .first_unbound()
                        .map(|v| v.volume.name.clone()),
                };
                match self.locks.acquire(&request, unbound.as_deref()).await? {
                    LockOutcome::Held(lease) => lease,
                    LockOutcome::Blocked(reason) => {
                        return self.wait(request, status, reason).await;
                    }
                }
            }
        };
        let content = match existing {
            Some(content) => {
                if status.stage != Stage::VolumeSnapshotting {
                    advance(&mut status.stage, Stage::ContentCreating)?;
                }
                content
            }
            None => {
                advance(&mut status.stage, Stage::SourceLocking)?;
                let created = self
                    .create_content(&request, &mut status, &vm, instance.as_ref(), &lease, now)
                    .await?;
                match created {
                    Some(content) => content,
                    None => {
                        let request = self.write_status(&request, status).await?;
                        return Ok(self.requeue(request.phase()));
                    }
                }
            }
        };

        self.snapshot_volumes(request, status, content, now).await
    }

    async fn wait(
        &self,
        request: SnapshotRequest,
        mut status: SnapshotRequestStatus,
        reason: BlockReason,
    ) -> Result<ReconcileOutcome> {
        let now = self.ports.clock.now();
        if status.stage.can_transition(Stage::SourceLocking) {
            advance(&mut status.stage, Stage::SourceLocking)?;
        }
        let message = reason.message(&request.source_key());
        debug!(request = %request.meta.key(), reason = %message, "waiting for source");
        apply(&mut status, &Activity::Waiting { reason: message }, now);
        status.ready_to_use = Some(false);
        let request = self.write_status(&request, status).await?;
        Ok(self.requeue(request.phase()))
    }

    /// Freezes the guest and stores the content artifact. Returns `None` when
    /// the pass must stop with `status` reporting an error.
    async fn create_content(
        &self,
        request: &SnapshotRequest,
        status: &mut SnapshotRequestStatus,
        vm: &VirtualMachine,
        instance: Option<&VmInstance>,
        lease: &SourceLease,
        now: DateTime<Utc>,
    ) -> Result<Option<SnapshotContent>> {
        let source = request.source_key();
        advance(&mut status.stage, Stage::Freezing)?;
        status.indications = indications_for(instance);

        if let FreezeOutcome::CommandFailed { message } = self.freezer.freeze(&source).await? {
            warn!(request = %request.meta.key(), error = %message, "guest freeze failed");
            self.record_event(request, EventType::Warning, EVENT_FREEZE_ERROR, message.clone());
            set_error(status, Some(message), now);
            apply(status, &Activity::Errored, now);
            status.ready_to_use = Some(false);
            return Ok(None);
        }

        advance(&mut status.stage, Stage::ContentCreating)?;
        let view = captured_view(&lease.captured, vm);
        let selection = self.selector.select(&view, instance).await?;
        match self
            .materializer
            .materialize(request, &lease.captured, &selection, &status.indications)
            .await
        {
            Ok(content) => Ok(Some(content)),
            Err(e @ SnapshotError::Rejected { .. }) | Err(e @ SnapshotError::Immutable { .. }) => {
                warn!(request = %request.meta.key(), error = %e, "snapshot content creation failed");
                self.freezer.thaw_if_frozen(&source).await?;
                set_error(
                    status,
                    Some(format!("Failed to create snapshot content with error: {}", e)),
                    now,
                );
                apply(status, &Activity::Errored, now);
                status.ready_to_use = Some(false);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn snapshot_volumes(
        &self,
        request: SnapshotRequest,
        mut status: SnapshotRequestStatus,
        mut content: SnapshotContent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let key = request.meta.key();
        let source = request.source_key();
        advance(&mut status.stage, Stage::VolumeSnapshotting)?;

        let report = self.driver.sync(&content).await?;
        if report.all_created() {
            self.freezer.thaw_if_frozen(&source).await?;
        }

        let aggregated = aggregate_status(&content, &report, now);
        if aggregated.is_some() && aggregated != content.status {
            content.status = aggregated;
            content = self.update_content_status(&content).await?;
        }

        status.content_name = Some(content.meta.name.clone());
        status.source_uid = Some(content.spec.source.uid.clone());
        status.indications = content.spec.indications.clone();
        status.snapshot_volumes = Some(content.spec.snapshot_volumes.clone());

        let rejected = report.rejected();
        let error = content
            .status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .and_then(|e| e.message.clone())
            .or_else(|| {
                rejected
                    .first()
                    .map(|(name, reason)| format!("Failed to create VolumeSnapshot {}: {}", name, reason))
            });
        set_error(&mut status, error, now);

        if report.all_created() && content.is_ready() {
            advance(&mut status.stage, Stage::Succeeded)?;
            apply(&mut status, &Activity::Complete { ready: true }, now);
            status.ready_to_use = Some(true);
            status.creation_time = content.status.as_ref().and_then(|s| s.creation_time);
            let request = self.write_status(&request, status).await?;
            info!(request = %key, content = %content.meta.name, "snapshot succeeded");
            self.locks.release(&request).await?;
            return Ok(self.requeue(Phase::Succeeded));
        }

        debug!(
            request = %key,
            created = report.created_count(),
            rejected = rejected.len(),
            "volume snapshots in progress"
        );
        apply(&mut status, &Activity::Progressing, now);
        status.ready_to_use = Some(false);
        let request = self.write_status(&request, status).await?;
        Ok(self.requeue(request.phase()))
    }

    // -----------------------------------------------------------------------
    // Terminal requests
    // -----------------------------------------------------------------------

    /// Keeps readiness of a succeeded request in step with its content.
    async fn track_succeeded(
        &self,
        request: SnapshotRequest,
        mut status: SnapshotRequestStatus,
    ) -> Result<ReconcileOutcome> {
        let now = self.ports.clock.now();
        self.locks.release(&request).await?;

        let content = self
            .ports
            .contents
            .get_content(&Self::content_key(&request))
            .await?;
        let ready = match content {
            Some(mut content) => {
                let report = self.driver.sync(&content).await?;
                let aggregated = aggregate_status(&content, &report, now);
                if aggregated.is_some() && aggregated != content.status {
                    content.status = aggregated;
                    content = self.update_content_status(&content).await?;
                }
                let error = content
                    .status
                    .as_ref()
                    .and_then(|s| s.error.as_ref())
                    .and_then(|e| e.message.clone());
                set_error(&mut status, error, now);
                content.is_ready()
            }
            None => false,
        };

        apply(&mut status, &Activity::Complete { ready }, now);
        status.ready_to_use = Some(ready);
        let request = self.write_status(&request, status).await?;
        Ok(self.requeue(request.phase()))
    }

    /// Re-applies failure cleanup; every step is idempotent.
    async fn settle_failed(
        &self,
        request: SnapshotRequest,
        status: SnapshotRequestStatus,
    ) -> Result<ReconcileOutcome> {
        let reason = status
            .conditions
            .iter()
            .find(|c| c.kind == ConditionType::Failure)
            .map(|c| c.reason.clone())
            .unwrap_or_else(|| REASON_DEADLINE_EXCEEDED.to_string());
        self.fail(request, status, &reason).await
    }

    /// Moves a request to `Failed`: mark it, thaw, delete partial content and
    /// write the failed status. The lease is released only once the guest is
    /// known to be thawed.
    async fn fail(
        &self,
        request: SnapshotRequest,
        mut status: SnapshotRequestStatus,
        reason: &str,
    ) -> Result<ReconcileOutcome> {
        let now = self.ports.clock.now();
        let first_failure = !request.meta.annotations.contains_key(FAILURE_REASON_ANNOTATION);
        let request = if first_failure {
            match self.mark_failed(&request, reason).await? {
                Some(request) => request,
                None => return Ok(ReconcileOutcome::gone()),
            }
        } else {
            request
        };

        let thawed = self.thaw_held_source(&request).await?;
        self.delete_children(&request).await?;

        status.stage = status.stage.transition(Stage::Failed)?;
        apply(
            &mut status,
            &Activity::Failed {
                reason: reason.to_string(),
            },
            now,
        );
        status.creation_time = None;
        status.ready_to_use = Some(false);
        status.content_name = None;
        let request = self.write_status(&request, status).await?;

        if first_failure {
            info!(request = %request.meta.key(), reason = %reason, "snapshot failed");
            self.record_event(
                &request,
                EventType::Warning,
                EVENT_SNAPSHOT_FAILED,
                format!("VirtualMachineSnapshot {} failed: {}", request.meta.name, reason),
            );
        }
        if !thawed {
            return Ok(self.requeue(Phase::Failed));
        }
        self.locks.release(&request).await?;
        Ok(ReconcileOutcome {
            phase: Some(Phase::Failed),
            requeue_after: None,
        })
    }

    /// Records the failure reason on the request metadata, where it survives
    /// a wiped status.
    async fn mark_failed(
        &self,
        request: &SnapshotRequest,
        reason: &str,
    ) -> Result<Option<SnapshotRequest>> {
        let key = request.meta.key();
        let key = &key;
        retry_on_conflict(&self.retry, move || async move {
            let Some(mut latest) = self.ports.requests.get_request(key).await? else {
                return Ok(None);
            };
            if latest.meta.annotations.contains_key(FAILURE_REASON_ANNOTATION) {
                return Ok(Some(latest));
            }
            latest
                .meta
                .annotations
                .insert(FAILURE_REASON_ANNOTATION.to_string(), reason.to_string());
            self.ports.requests.update_request(&latest).await
        })
        .await
    }

    /// Thaws the source if this request holds its lease. Returns false while
    /// the guest may still be frozen on this request's behalf.
    async fn thaw_held_source(&self, request: &SnapshotRequest) -> Result<bool> {
        if !self.locks.holds(request).await? {
            return Ok(true);
        }
        match self.freezer.thaw_if_frozen(&request.source_key()).await {
            Ok(_) => Ok(true),
            Err(e @ (SnapshotError::GuestTransport { .. } | SnapshotError::GuestCommand { .. })) => {
                warn!(request = %request.meta.key(), error = %e, "thaw failed, keeping source lease");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_children(&self, request: &SnapshotRequest) -> Result<()> {
        let content_key = Self::content_key(request);
        if let Some(content) = self.ports.contents.get_content(&content_key).await? {
            let deleted = self.driver.delete_all(&content).await?;
            self.ports.contents.delete_content(&content_key).await?;
            info!(
                request = %request.meta.key(),
                content = %content_key.name,
                volume_snapshots = deleted,
                "deleted snapshot content"
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    async fn finalize_deletion(&self, request: SnapshotRequest) -> Result<ReconcileOutcome> {
        let key = request.meta.key();
        if !request.meta.has_finalizer(REQUEST_CLEANUP_FINALIZER) {
            return Ok(ReconcileOutcome::gone());
        }

        let mut status = request.status.clone().unwrap_or_default();
        status.stage = status.stage.transition(Stage::Deleting)?;
        let request = self.write_status(&request, status).await?;

        let thawed = self.thaw_held_source(&request).await?;
        self.delete_children(&request).await?;
        if !thawed {
            return Ok(self.requeue(request.phase()));
        }
        self.locks.release(&request).await?;

        let key_ref = &key;
        retry_on_conflict(&self.retry, move || async move {
            let Some(mut latest) = self.ports.requests.get_request(key_ref).await? else {
                return Ok(None);
            };
            latest.meta.remove_finalizer(REQUEST_CLEANUP_FINALIZER);
            self.ports.requests.update_request(&latest).await
        })
        .await?;
        info!(request = %key, "snapshot request cleaned up");
        Ok(ReconcileOutcome::gone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_walks_forward_path() {
        let mut stage = Stage::NewRequest;
        advance(&mut stage, Stage::ContentCreating).unwrap();
        assert_eq!(stage, Stage::ContentCreating);
        advance(&mut stage, Stage::ContentCreating).unwrap();
        advance(&mut stage, Stage::Succeeded).unwrap();
        assert_eq!(stage, Stage::Succeeded);
    }

    #[test]
    fn test_advance_backwards_within_locking_group() {
        let mut stage = Stage::ContentCreating;
        advance(&mut stage, Stage::SourceLocking).unwrap();
        assert_eq!(stage, Stage::SourceLocking);
    }

    #[test]
    fn test_advance_rejects_illegal_edge() {
        let mut stage = Stage::VolumeSnapshotting;
        assert!(advance(&mut stage, Stage::Freezing).is_err());
        let mut stage = Stage::Succeeded;
        assert!(advance(&mut stage, Stage::VolumeSnapshotting).is_err());
        assert_eq!(stage, Stage::Succeeded);
    }

    #[test]
    fn test_set_error_keeps_time_for_same_message() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let t1 = t0 + chrono::Duration::seconds(5);
        let mut status = SnapshotRequestStatus::default();
        set_error(&mut status, Some("boom".to_string()), t0);
        set_error(&mut status, Some("boom".to_string()), t1);
        assert_eq!(status.error.as_ref().and_then(|e| e.time), Some(t0));
        set_error(&mut status, None, t1);
        assert!(status.error.is_none());
    }
}
