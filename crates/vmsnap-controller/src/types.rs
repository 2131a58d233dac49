//! Resource model for snapshot orchestration.
//!
//! Every persisted object carries an [`ObjectMeta`] with a monotonically
//! increasing `resource_version`; stores use it for compare-and-swap updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::state::{Phase, Stage};

/// Label placed on every storage-engine snapshot object, naming the source VM.
pub const SOURCE_VM_NAME_LABEL: &str = "snapshot.kubevirt.io/source-vm-name";
/// Finalizer held on a VM while an operation owns its source lease.
pub const SOURCE_PROTECTION_FINALIZER: &str = "snapshot.kubevirt.io/snapshot-source-protection";
/// Finalizer that keeps a request around until the reconciler has cleaned up.
pub const REQUEST_CLEANUP_FINALIZER: &str = "snapshot.kubevirt.io/vmsnapshot-protection";
/// Annotation recording the reason a request failed terminally.
pub const FAILURE_REASON_ANNOTATION: &str = "snapshot.kubevirt.io/failure-reason";
/// Prefix of the backend state claim a VM with persistent devices owns.
pub const BACKEND_STATE_CLAIM_PREFIX: &str = "persistent-state-for";

/// Namespaced object name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace the object lives in.
    pub namespace: String,
    /// Object name, unique within the namespace and kind.
    pub name: String,
}

impl ObjectKey {
    /// Creates a key from a namespace and a name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns a key for another object in the same namespace.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata common to every stored object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Unique identity assigned by the store on creation.
    pub uid: String,
    /// Optimistic-concurrency token; bumped by the store on every write.
    pub resource_version: u64,
    /// Bumped by the store whenever the spec changes.
    pub generation: u64,
    /// Free-form labels.
    pub labels: BTreeMap<String, String>,
    /// Non-identifying metadata written by controllers.
    pub annotations: BTreeMap<String, String>,
    /// Finalizers blocking removal.
    pub finalizers: Vec<String>,
    /// Set by the store on creation.
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set by the store when deletion was requested while finalizers remain.
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Creates metadata for a new object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns the namespaced key of this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// True once deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// True if the finalizer is present.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds the finalizer; returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes the finalizer; returns false if it was absent.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

// ---------------------------------------------------------------------------
// Virtual machines
// ---------------------------------------------------------------------------

/// How the VM controller keeps the VM running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStrategy {
    /// Always keep an instance running.
    Always,
    /// Never run an instance.
    #[default]
    Halted,
    /// Start/stop only on explicit user request.
    Manual,
    /// Restart on failure only.
    RerunOnFailure,
}

/// Where a VM volume's data comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Data volume whose claim shares its name.
    DataVolume {
        /// Data volume (and claim) name.
        name: String,
    },
    /// Plain persistent volume claim.
    PersistentVolumeClaim {
        /// Claim name.
        claim_name: String,
        /// Attached through hotplug.
        #[serde(default)]
        hotpluggable: bool,
    },
    /// Claim receiving a memory dump of the running guest.
    MemoryDump {
        /// Claim name.
        claim_name: String,
    },
    /// Read-only container image disk.
    ContainerDisk {
        /// Image reference.
        image: String,
    },
    /// Cloud-init NoCloud seed disk.
    CloudInitNoCloud {
        /// Inline user data.
        user_data: String,
    },
    /// Scratch disk discarded with the instance.
    EmptyDisk {
        /// Capacity in bytes.
        capacity_bytes: u64,
    },
}

impl VolumeSource {
    /// Backing claim name, if the source is claim-backed.
    pub fn claim_name(&self) -> Option<&str> {
        match self {
            VolumeSource::DataVolume { name } => Some(name),
            VolumeSource::PersistentVolumeClaim { claim_name, .. } => Some(claim_name),
            VolumeSource::MemoryDump { claim_name } => Some(claim_name),
            _ => None,
        }
    }

    /// Short type name used in human-readable reasons.
    pub fn type_name(&self) -> &'static str {
        match self {
            VolumeSource::DataVolume { .. } => "dataVolume",
            VolumeSource::PersistentVolumeClaim { .. } => "persistentVolumeClaim",
            VolumeSource::MemoryDump { .. } => "memoryDump",
            VolumeSource::ContainerDisk { .. } => "containerDisk",
            VolumeSource::CloudInitNoCloud { .. } => "cloudInitNoCloud",
            VolumeSource::EmptyDisk { .. } => "emptyDisk",
        }
    }
}

/// A named VM volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name, unique within the VM.
    pub name: String,
    /// Data source.
    pub source: VolumeSource,
}

impl Volume {
    /// Creates a named volume.
    pub fn new(name: impl Into<String>, source: VolumeSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

/// Desired state of a VM.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSpec {
    /// Run strategy.
    pub run_strategy: RunStrategy,
    /// Requested guest memory, e.g. `"128Mi"`.
    pub memory_request: String,
    /// Guest vCPU count.
    pub cpu_cores: u32,
    /// Instance type reference, resolved elsewhere.
    pub instancetype: Option<String>,
    /// Preference reference, resolved elsewhere.
    pub preference: Option<String>,
    /// Names of data volumes the VM owns.
    pub data_volume_templates: Vec<String>,
    /// Volumes in template order.
    pub volumes: Vec<Volume>,
    /// Persistent TPM/EFI state, backed by a dedicated claim.
    pub persistent_state: bool,
}

/// Kind of operation holding a source lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseKind {
    /// A snapshot request.
    Snapshot,
    /// A restore request.
    Restore,
}

/// Source spec and identity as observed when a lease was acquired.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedSource {
    /// VM name.
    pub name: String,
    /// VM namespace.
    pub namespace: String,
    /// VM uid.
    pub uid: String,
    /// VM generation at capture.
    pub generation: u64,
    /// VM labels at capture.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Full VM spec at capture.
    pub spec: VmSpec,
}

impl CapturedSource {
    /// Captures the current spec and identity of a VM.
    pub fn of(vm: &VirtualMachine) -> Self {
        Self {
            name: vm.meta.name.clone(),
            namespace: vm.meta.namespace.clone(),
            uid: vm.meta.uid.clone(),
            generation: vm.meta.generation,
            labels: vm.meta.labels.clone(),
            spec: vm.spec.clone(),
        }
    }
}

/// Single-writer lease recorded on the source VM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceLease {
    /// Holder kind.
    pub kind: LeaseKind,
    /// Holder object name (same namespace as the VM).
    pub holder: String,
    /// Holder object uid.
    pub holder_uid: String,
    /// When the lease was taken.
    pub acquired_at: DateTime<Utc>,
    /// Source as seen by the compare-and-swap that took the lease.
    pub captured: CapturedSource,
}

/// Progress of a memory dump request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryDumpPhase {
    /// Dump is being written.
    InProgress,
    /// Dump is complete and the claim is consistent.
    Completed,
    /// Dump failed.
    Failed,
}

/// Memory dump associated with the VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDumpRequest {
    /// Claim receiving the dump.
    pub claim_name: String,
    /// Dump progress.
    pub phase: MemoryDumpPhase,
}

/// Snapshot eligibility reported on the VM for one volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshotStatus {
    /// Volume name.
    pub name: String,
    /// Whether the volume would be included in a snapshot.
    pub enabled: bool,
    /// Why the volume is excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Observed state of a VM.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmStatus {
    /// Lease held by an in-flight snapshot or restore.
    pub source_lease: Option<SourceLease>,
    /// Memory dump, if one was requested.
    pub memory_dump: Option<MemoryDumpRequest>,
    /// Per-volume snapshot eligibility.
    pub volume_snapshot_statuses: Vec<VolumeSnapshotStatus>,
}

/// A virtual machine definition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachine {
    /// Object metadata.
    pub meta: ObjectMeta,
    /// Desired state.
    pub spec: VmSpec,
    /// Observed state.
    pub status: VmStatus,
}

impl VirtualMachine {
    /// Name of the backend state claim this VM would own.
    pub fn backend_state_claim(&self) -> String {
        format!("{}-{}", BACKEND_STATE_CLAIM_PREFIX, self.meta.name)
    }
}

/// Lifecycle phase of a running instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    /// Scheduled but not started.
    #[default]
    Pending,
    /// Guest is running.
    Running,
    /// Guest has stopped.
    Succeeded,
    /// Guest crashed.
    Failed,
}

/// Filesystem freeze state as reported by the guest agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezeStatus {
    /// Filesystems accept writes.
    #[default]
    Thawed,
    /// Filesystems are frozen.
    Frozen,
}

/// The running instance of a VM.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmInstance {
    /// Object metadata; shares the VM's name.
    pub meta: ObjectMeta,
    /// Lifecycle phase.
    pub phase: InstancePhase,
    /// Guest agent connection state.
    pub agent_connected: bool,
    /// Filesystem freeze state.
    pub fs_freeze_status: FreezeStatus,
    /// Volumes hotplugged into the instance only; gone with it.
    pub temporary_volumes: Vec<Volume>,
}

impl VmInstance {
    /// True if the guest is running.
    pub fn is_running(&self) -> bool {
        self.phase == InstancePhase::Running
    }

    /// True if a freeze would be honoured by a guest agent.
    pub fn can_freeze(&self) -> bool {
        self.is_running() && self.agent_connected
    }

    /// True if filesystems are frozen.
    pub fn is_frozen(&self) -> bool {
        self.fs_freeze_status == FreezeStatus::Frozen
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Volume mode of a claim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeMode {
    /// Formatted filesystem.
    #[default]
    Filesystem,
    /// Raw block device.
    Block,
}

/// Claim binding phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    /// Not yet bound (e.g. waiting for first consumer).
    #[default]
    Pending,
    /// Bound to a volume.
    Bound,
    /// Bound volume was lost.
    Lost,
}

/// Claim spec; copied verbatim into volume backups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimSpec {
    /// Storage class.
    pub storage_class: Option<String>,
    /// Access modes, e.g. `ReadWriteOnce`.
    pub access_modes: Vec<String>,
    /// Volume mode.
    pub volume_mode: VolumeMode,
    /// Requested capacity.
    pub requested_bytes: u64,
    /// Bound volume name.
    pub volume_name: Option<String>,
}

/// A persistent volume claim.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentVolumeClaim {
    /// Object metadata.
    pub meta: ObjectMeta,
    /// Claim spec.
    pub spec: ClaimSpec,
    /// Binding phase.
    pub phase: ClaimPhase,
}

impl PersistentVolumeClaim {
    /// True if bound to a volume.
    pub fn is_bound(&self) -> bool {
        self.phase == ClaimPhase::Bound
    }
}

// ---------------------------------------------------------------------------
// Storage-engine snapshot objects
// ---------------------------------------------------------------------------

/// Error reported by an object's owner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectError {
    /// When the error was observed.
    pub time: Option<DateTime<Utc>>,
    /// Human-readable message.
    pub message: Option<String>,
}

impl ObjectError {
    /// Creates an error with a message.
    pub fn new(message: impl Into<String>, time: Option<DateTime<Utc>>) -> Self {
        Self {
            time,
            message: Some(message.into()),
        }
    }
}

/// State reported by the storage engine for one snapshot object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSnapshotState {
    /// When the point-in-time copy was cut.
    pub creation_time: Option<DateTime<Utc>>,
    /// Whether the copy can be restored from.
    pub ready_to_use: Option<bool>,
    /// Last error; may be transient.
    pub error: Option<ObjectError>,
}

/// One storage-engine snapshot of a claim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSnapshot {
    /// Object metadata.
    pub meta: ObjectMeta,
    /// Claim being copied.
    pub source_claim: String,
    /// Content artifact owning this object.
    pub owner_content: String,
    /// Engine-reported state; absent until the engine first reports.
    pub status: Option<VolumeSnapshotState>,
}

// ---------------------------------------------------------------------------
// Snapshot requests
// ---------------------------------------------------------------------------

/// Condition types rendered on a request, in rendering order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    /// The operation is actively moving forward.
    Progressing,
    /// The snapshot can be restored from.
    Ready,
    /// The operation failed terminally.
    Failure,
}

/// Tri-state condition status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// Condition holds.
    True,
    /// Condition does not hold.
    False,
    /// Not determined.
    Unknown,
}

/// A status condition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition type.
    #[serde(rename = "type")]
    pub kind: ConditionType,
    /// Status.
    pub status: ConditionStatus,
    /// Short machine-stable reason.
    pub reason: String,
    /// When `status` or `reason` last changed.
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Labels summarising the circumstances a snapshot was captured under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Indication {
    /// Guest agent was connected and filesystems were frozen.
    GuestAgent,
    /// Guest was running without a connected agent.
    NoGuestAgent,
    /// Guest was running.
    Online,
}

/// Volumes included in and excluded from a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotVolumeLists {
    /// Included volume names.
    pub included: Vec<String>,
    /// Excluded volume names.
    pub excluded: Vec<String>,
}

/// Desired state of a snapshot request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotRequestSpec {
    /// Source VM name, same namespace as the request.
    pub source_name: String,
    /// How long the request may stay unfinished before failing.
    pub failure_deadline: Option<Duration>,
}

/// Observed state of a snapshot request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotRequestStatus {
    /// Coarse phase.
    pub phase: Phase,
    /// State-machine stage.
    pub stage: Stage,
    /// Ordered conditions.
    pub conditions: Vec<Condition>,
    /// Capture circumstances.
    pub indications: Vec<Indication>,
    /// Set iff phase is `Succeeded`.
    pub creation_time: Option<DateTime<Utc>>,
    /// Whether the snapshot can be restored from.
    pub ready_to_use: Option<bool>,
    /// Uid of the source VM.
    pub source_uid: Option<String>,
    /// Name of the content artifact.
    pub content_name: Option<String>,
    /// Last error.
    pub error: Option<ObjectError>,
    /// Included/excluded volume names.
    pub snapshot_volumes: Option<SnapshotVolumeLists>,
}

impl SnapshotRequestStatus {
    /// Looks up a condition by type.
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// True if the condition is present with status `True`.
    pub fn condition_is_true(&self, kind: ConditionType) -> bool {
        self.condition(kind)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}

/// A request to snapshot one VM.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotRequest {
    /// Object metadata.
    pub meta: ObjectMeta,
    /// Desired state.
    pub spec: SnapshotRequestSpec,
    /// Observed state; `None` until first reconciled or after a wipe.
    pub status: Option<SnapshotRequestStatus>,
}

impl SnapshotRequest {
    /// Creates a request for a VM in the same namespace.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec: SnapshotRequestSpec {
                source_name: source_name.into(),
                failure_deadline: None,
            },
            status: None,
        }
    }

    /// Sets the failure deadline.
    pub fn with_failure_deadline(mut self, deadline: Duration) -> Self {
        self.spec.failure_deadline = Some(deadline);
        self
    }

    /// Key of the source VM.
    pub fn source_key(&self) -> ObjectKey {
        self.meta.key().sibling(self.spec.source_name.clone())
    }

    /// Current phase, `Unknown` without a status.
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Content artifacts
// ---------------------------------------------------------------------------

/// Claim name plus a deep copy of its spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCopy {
    /// Claim name.
    pub name: String,
    /// Claim spec at capture.
    pub spec: ClaimSpec,
}

/// One volume's entry in a content artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBackup {
    /// VM volume name.
    pub volume_name: String,
    /// Backing claim.
    pub claim: ClaimCopy,
    /// Name of the storage-engine snapshot object.
    pub volume_snapshot_name: String,
}

/// Immutable content spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentSpec {
    /// Owning request name.
    pub request_name: String,
    /// Captured source VM.
    pub source: CapturedSource,
    /// Volume backups in included-volume order.
    pub volume_backups: Vec<VolumeBackup>,
    /// Capture circumstances.
    #[serde(default)]
    pub indications: Vec<Indication>,
    /// Included/excluded volume names at capture.
    #[serde(default)]
    pub snapshot_volumes: SnapshotVolumeLists,
}

/// Recorded state of one storage-engine snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshotRecord {
    /// Snapshot object name.
    pub volume_snapshot_name: String,
    /// Creation time reported by the engine.
    pub creation_time: Option<DateTime<Utc>>,
    /// Readiness reported by the engine.
    pub ready_to_use: Option<bool>,
    /// Last engine error.
    pub error: Option<ObjectError>,
}

impl VolumeSnapshotRecord {
    /// True if the engine reports the copy ready.
    pub fn is_ready(&self) -> bool {
        self.ready_to_use == Some(true)
    }

    /// True if the engine reports the copy cut.
    pub fn is_created(&self) -> bool {
        self.creation_time.is_some()
    }
}

/// Aggregated content status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentStatus {
    /// When every volume had been captured.
    pub creation_time: Option<DateTime<Utc>>,
    /// All volume snapshots ready.
    pub ready_to_use: Option<bool>,
    /// Hard content error (missing snapshot objects).
    pub error: Option<ObjectError>,
    /// Per-volume records, in backup order.
    pub volume_snapshot_status: Vec<VolumeSnapshotRecord>,
}

/// The immutable snapshot artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContent {
    /// Object metadata.
    pub meta: ObjectMeta,
    /// Write-once spec.
    pub spec: ContentSpec,
    /// Aggregated status; absent until every volume snapshot exists.
    #[serde(default)]
    pub status: Option<ContentStatus>,
}

impl SnapshotContent {
    /// True if the aggregated status reports ready.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something needs attention.
    Warning,
}

/// Event emitted against an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Object the event is about.
    pub object: ObjectKey,
    /// Kind of the object, e.g. `VirtualMachineSnapshot`.
    pub object_kind: String,
    /// Severity.
    pub event_type: EventType,
    /// Machine-stable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}
