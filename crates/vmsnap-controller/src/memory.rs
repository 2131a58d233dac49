//! In-memory cluster implementing every collaborator port.
//!
//! Objects are stored in `DashMap`s keyed by [`ObjectKey`]. Writes follow the
//! optimistic-concurrency rules of a real API server: every write bumps a
//! global resource version, updates are rejected with a conflict when the
//! caller's version is stale, and objects with finalizers are only marked on
//! deletion. Fault injection hooks let tests deny volume snapshot creation,
//! make the guest agent fail, or control volume snapshot readiness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SnapshotError};
use crate::ports::{
    ClaimApi, ContentStore, EventRecorder, GuestAgent, Ports, SnapshotRequestStore,
    StorageClassCatalog, VmApi, VolumeSnapshotApi,
};
use crate::types::{
    Event, FreezeStatus, ObjectError, ObjectKey, ObjectMeta, PersistentVolumeClaim,
    SnapshotContent, SnapshotRequest, VirtualMachine, VmInstance, VolumeSnapshot,
    VolumeSnapshotState, SOURCE_VM_NAME_LABEL,
};

const KIND_VM: &str = "VirtualMachine";
const KIND_CLAIM: &str = "PersistentVolumeClaim";
const KIND_VOLUME_SNAPSHOT: &str = "VolumeSnapshot";
const KIND_REQUEST: &str = "VirtualMachineSnapshot";
const KIND_CONTENT: &str = "VirtualMachineSnapshotContent";

/// Call counters for side-effecting operations.
#[derive(Debug, Default)]
pub struct CallCounters {
    freeze: AtomicU64,
    thaw: AtomicU64,
    volume_snapshot_create: AtomicU64,
    content_create: AtomicU64,
}

impl CallCounters {
    /// Successful or failed freeze calls that reached the guest.
    pub fn freezes(&self) -> u64 {
        self.freeze.load(Ordering::SeqCst)
    }

    /// Thaw calls that reached the guest.
    pub fn thaws(&self) -> u64 {
        self.thaw.load(Ordering::SeqCst)
    }

    /// Volume snapshot create calls, including rejected ones.
    pub fn volume_snapshot_creates(&self) -> u64 {
        self.volume_snapshot_create.load(Ordering::SeqCst)
    }

    /// Content create calls, including ones that found the name taken.
    pub fn content_creates(&self) -> u64 {
        self.content_create.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Faults {
    deny_volume_snapshots_for_vm: HashSet<String>,
    freeze_failure: Option<String>,
}

/// Cluster state held entirely in process memory.
pub struct InMemoryCluster {
    vms: DashMap<ObjectKey, VirtualMachine>,
    instances: DashMap<ObjectKey, VmInstance>,
    claims: DashMap<ObjectKey, PersistentVolumeClaim>,
    storage_classes: DashMap<String, Option<String>>,
    volume_snapshots: DashMap<ObjectKey, VolumeSnapshot>,
    requests: DashMap<ObjectKey, SnapshotRequest>,
    contents: DashMap<ObjectKey, SnapshotContent>,
    events: Mutex<Vec<Event>>,
    faults: Mutex<Faults>,
    guest_unreachable: AtomicBool,
    auto_ready: AtomicBool,
    counters: CallCounters,
    version: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("vms", &self.vms.len())
            .field("requests", &self.requests.len())
            .field("contents", &self.contents.len())
            .field("volume_snapshots", &self.volume_snapshots.len())
            .finish()
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryCluster {
    /// Creates an empty cluster reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            vms: DashMap::new(),
            instances: DashMap::new(),
            claims: DashMap::new(),
            storage_classes: DashMap::new(),
            volume_snapshots: DashMap::new(),
            requests: DashMap::new(),
            contents: DashMap::new(),
            events: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            guest_unreachable: AtomicBool::new(false),
            auto_ready: AtomicBool::new(true),
            counters: CallCounters::default(),
            version: AtomicU64::new(0),
            clock,
        }
    }

    /// Returns a port bundle backed by this cluster.
    pub fn ports(self: &Arc<Self>) -> Ports {
        Ports {
            vms: self.clone(),
            guest: self.clone(),
            claims: self.clone(),
            storage_classes: self.clone(),
            volume_snapshots: self.clone(),
            requests: self.clone(),
            contents: self.clone(),
            events: self.clone(),
            clock: self.clock.clone(),
        }
    }

    /// The cluster's time source.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Side-effect call counters.
    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn init_meta(&self, meta: &mut ObjectMeta) {
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        meta.resource_version = self.next_version();
        meta.generation = 1;
        meta.creation_timestamp.get_or_insert_with(|| self.clock.now());
        meta.deletion_timestamp = None;
    }

    // -----------------------------------------------------------------------
    // Seeding and direct manipulation
    // -----------------------------------------------------------------------

    /// Stores a VM, replacing any existing one. Returns the stored copy.
    pub fn put_vm(&self, mut vm: VirtualMachine) -> VirtualMachine {
        let key = vm.meta.key();
        match self.vms.get(&key) {
            Some(existing) => {
                let generation = if existing.spec != vm.spec {
                    existing.meta.generation + 1
                } else {
                    existing.meta.generation
                };
                vm.meta.uid = existing.meta.uid.clone();
                vm.meta.creation_timestamp = existing.meta.creation_timestamp;
                vm.meta.generation = generation;
                vm.meta.resource_version = self.next_version();
            }
            None => self.init_meta(&mut vm.meta),
        }
        self.vms.insert(key, vm.clone());
        vm
    }

    /// Applies `edit` to a stored VM's spec, as a user edit would.
    pub fn edit_vm_spec<F>(&self, key: &ObjectKey, edit: F) -> Result<VirtualMachine>
    where
        F: FnOnce(&mut crate::types::VmSpec),
    {
        let mut entry = self
            .vms
            .get_mut(key)
            .ok_or_else(|| SnapshotError::not_found(KIND_VM, key))?;
        edit(&mut entry.spec);
        entry.meta.generation += 1;
        entry.meta.resource_version = self.next_version();
        Ok(entry.clone())
    }

    /// Removes a VM.
    pub fn remove_vm(&self, key: &ObjectKey) -> Option<VirtualMachine> {
        self.vms.remove(key).map(|(_, v)| v)
    }

    /// Stores a running instance.
    pub fn put_instance(&self, mut instance: VmInstance) {
        if instance.meta.uid.is_empty() {
            self.init_meta(&mut instance.meta);
        }
        self.instances.insert(instance.meta.key(), instance);
    }

    /// Removes an instance (the VM stopped).
    pub fn remove_instance(&self, key: &ObjectKey) -> Option<VmInstance> {
        self.instances.remove(key).map(|(_, v)| v)
    }

    /// Current instance state, read synchronously.
    pub fn instance(&self, key: &ObjectKey) -> Option<VmInstance> {
        self.instances.get(key).map(|i| i.clone())
    }

    /// Stores a claim.
    pub fn put_claim(&self, mut claim: PersistentVolumeClaim) {
        if claim.meta.uid.is_empty() {
            self.init_meta(&mut claim.meta);
        }
        self.claims.insert(claim.meta.key(), claim);
    }

    /// Marks a claim as being deleted.
    pub fn mark_claim_deleting(&self, key: &ObjectKey) -> Result<()> {
        let mut entry = self
            .claims
            .get_mut(key)
            .ok_or_else(|| SnapshotError::not_found(KIND_CLAIM, key))?;
        entry.meta.deletion_timestamp = Some(self.clock.now());
        entry.meta.resource_version = self.next_version();
        Ok(())
    }

    /// Registers a storage class; `snapshot_class` is `None` when the class
    /// cannot take volume snapshots.
    pub fn put_storage_class(&self, name: impl Into<String>, snapshot_class: Option<String>) {
        self.storage_classes.insert(name.into(), snapshot_class);
    }

    /// Current VM state, read synchronously.
    pub fn vm(&self, key: &ObjectKey) -> Option<VirtualMachine> {
        self.vms.get(key).map(|v| v.clone())
    }

    /// Current request state, read synchronously.
    pub fn request(&self, key: &ObjectKey) -> Option<SnapshotRequest> {
        self.requests.get(key).map(|r| r.clone())
    }

    /// Current content state, read synchronously.
    pub fn content(&self, key: &ObjectKey) -> Option<SnapshotContent> {
        self.contents.get(key).map(|c| c.clone())
    }

    /// Number of stored content artifacts.
    pub fn content_count(&self) -> usize {
        self.contents.len()
    }

    /// Current volume snapshot state, read synchronously.
    pub fn volume_snapshot(&self, key: &ObjectKey) -> Option<VolumeSnapshot> {
        self.volume_snapshots.get(key).map(|v| v.clone())
    }

    /// All stored volume snapshots, sorted by key.
    pub fn volume_snapshots(&self) -> Vec<VolumeSnapshot> {
        let mut all: Vec<_> = self.volume_snapshots.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.meta.key().cmp(&b.meta.key()));
        all
    }

    /// Removes a volume snapshot behind the controller's back.
    pub fn remove_volume_snapshot(&self, key: &ObjectKey) -> Option<VolumeSnapshot> {
        self.volume_snapshots.remove(key).map(|(_, v)| v)
    }

    /// Overwrites the engine-reported state of a volume snapshot.
    pub fn set_volume_snapshot_state(
        &self,
        key: &ObjectKey,
        ready: Option<bool>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut entry = self
            .volume_snapshots
            .get_mut(key)
            .ok_or_else(|| SnapshotError::not_found(KIND_VOLUME_SNAPSHOT, key))?;
        let state = entry.status.get_or_insert_with(VolumeSnapshotState::default);
        state.creation_time.get_or_insert(now);
        state.ready_to_use = ready;
        state.error = error.map(|m| ObjectError::new(m, Some(now)));
        entry.meta.resource_version = self.next_version();
        Ok(())
    }

    /// Marks every volume snapshot ready.
    pub fn ready_all_volume_snapshots(&self) {
        let keys: Vec<ObjectKey> = self.volume_snapshots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Err(e) = self.set_volume_snapshot_state(&key, Some(true), None) {
                debug!(volume_snapshot = %key, error = %e, "volume snapshot vanished before ready");
            }
        }
    }

    /// Wipes a request's status, as an external actor might.
    pub fn wipe_request_status(&self, key: &ObjectKey) -> Result<()> {
        let mut entry = self
            .requests
            .get_mut(key)
            .ok_or_else(|| SnapshotError::not_found(KIND_REQUEST, key))?;
        entry.status = None;
        entry.meta.resource_version = self.next_version();
        Ok(())
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded events with the given reason.
    pub fn events_with_reason(&self, reason: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Rejects volume snapshot creation for objects labelled with this VM.
    pub fn deny_volume_snapshots_for(&self, vm_name: impl Into<String>) {
        self.lock_faults().deny_volume_snapshots_for_vm.insert(vm_name.into());
    }

    /// Lifts a volume snapshot denial.
    pub fn allow_volume_snapshots_for(&self, vm_name: &str) {
        self.lock_faults().deny_volume_snapshots_for_vm.remove(vm_name);
    }

    /// Makes every freeze command fail with `message`, or succeed with `None`.
    pub fn set_freeze_failure(&self, message: Option<String>) {
        self.lock_faults().freeze_failure = message;
    }

    /// Makes the guest agent unreachable.
    pub fn set_guest_unreachable(&self, unreachable: bool) {
        self.guest_unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Whether new volume snapshots report ready immediately (default true).
    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.auto_ready.store(auto_ready, Ordering::SeqCst);
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_guest(&self, key: &ObjectKey) -> Result<()> {
        if self.guest_unreachable.load(Ordering::SeqCst) {
            return Err(SnapshotError::GuestTransport {
                key: key.clone(),
                reason: "connection refused".to_string(),
            });
        }
        if !self.instances.contains_key(key) {
            return Err(SnapshotError::GuestTransport {
                key: key.clone(),
                reason: "instance is not running".to_string(),
            });
        }
        Ok(())
    }

    fn set_freeze_status(&self, key: &ObjectKey, status: FreezeStatus) {
        if let Some(mut inst) = self.instances.get_mut(key) {
            inst.fs_freeze_status = status;
            inst.meta.resource_version = self.next_version();
        }
    }
}

fn in_namespace(meta: &ObjectMeta, namespace: Option<&str>) -> bool {
    namespace.map(|ns| meta.namespace == ns).unwrap_or(true)
}

fn conflict(kind: &'static str, key: &ObjectKey, expected: u64, actual: u64) -> SnapshotError {
    SnapshotError::Conflict {
        kind,
        key: key.clone(),
        expected,
        actual,
    }
}

#[async_trait]
impl VmApi for InMemoryCluster {
    async fn get_vm(&self, key: &ObjectKey) -> Result<Option<VirtualMachine>> {
        Ok(self.vm(key))
    }

    async fn list_vms(&self, namespace: Option<&str>) -> Result<Vec<VirtualMachine>> {
        let mut vms: Vec<_> = self
            .vms
            .iter()
            .filter(|e| in_namespace(&e.meta, namespace))
            .map(|e| e.value().clone())
            .collect();
        vms.sort_by(|a, b| a.meta.key().cmp(&b.meta.key()));
        Ok(vms)
    }

    async fn update_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let key = vm.meta.key();
        let mut entry = self
            .vms
            .get_mut(&key)
            .ok_or_else(|| SnapshotError::not_found(KIND_VM, &key))?;
        if entry.meta.resource_version != vm.meta.resource_version {
            return Err(conflict(
                KIND_VM,
                &key,
                vm.meta.resource_version,
                entry.meta.resource_version,
            ));
        }
        entry.meta.labels = vm.meta.labels.clone();
        entry.meta.finalizers = vm.meta.finalizers.clone();
        entry.status = vm.status.clone();
        entry.meta.resource_version = self.next_version();
        Ok(entry.clone())
    }

    async fn get_instance(&self, key: &ObjectKey) -> Result<Option<VmInstance>> {
        Ok(self.instance(key))
    }
}

#[async_trait]
impl GuestAgent for InMemoryCluster {
    async fn freeze(&self, instance: &ObjectKey) -> Result<()> {
        self.check_guest(instance)?;
        self.counters.freeze.fetch_add(1, Ordering::SeqCst);
        let failure = self.lock_faults().freeze_failure.clone();
        if let Some(message) = failure {
            return Err(SnapshotError::GuestCommand { message });
        }
        self.set_freeze_status(instance, FreezeStatus::Frozen);
        debug!(instance = %instance, "guest filesystems frozen");
        Ok(())
    }

    async fn thaw(&self, instance: &ObjectKey) -> Result<()> {
        self.check_guest(instance)?;
        self.counters.thaw.fetch_add(1, Ordering::SeqCst);
        self.set_freeze_status(instance, FreezeStatus::Thawed);
        debug!(instance = %instance, "guest filesystems thawed");
        Ok(())
    }
}

#[async_trait]
impl ClaimApi for InMemoryCluster {
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims.get(key).map(|c| c.clone()))
    }
}

#[async_trait]
impl StorageClassCatalog for InMemoryCluster {
    async fn snapshot_class_for(&self, storage_class: &str) -> Result<Option<String>> {
        Ok(self
            .storage_classes
            .get(storage_class)
            .and_then(|c| c.value().clone()))
    }
}

#[async_trait]
impl VolumeSnapshotApi for InMemoryCluster {
    async fn get_volume_snapshot(&self, key: &ObjectKey) -> Result<Option<VolumeSnapshot>> {
        Ok(self.volume_snapshot(key))
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let key = snapshot.meta.key();
        self.counters.volume_snapshot_create.fetch_add(1, Ordering::SeqCst);

        let source_vm = snapshot.meta.labels.get(SOURCE_VM_NAME_LABEL).cloned();
        if let Some(vm) = source_vm {
            if self.lock_faults().deny_volume_snapshots_for_vm.contains(&vm) {
                return Err(SnapshotError::Rejected {
                    kind: KIND_VOLUME_SNAPSHOT,
                    key,
                    reason: format!("volume snapshots for VM {} are denied", vm),
                });
            }
        }

        let claim_key = key.sibling(snapshot.source_claim.clone());
        if !self.claims.contains_key(&claim_key) {
            return Err(SnapshotError::Rejected {
                kind: KIND_VOLUME_SNAPSHOT,
                key,
                reason: format!("source claim {} not found", claim_key),
            });
        }

        let now = self.now();
        let mut stored = snapshot.clone();
        self.init_meta(&mut stored.meta);
        stored.status = Some(VolumeSnapshotState {
            creation_time: Some(now),
            ready_to_use: Some(self.auto_ready.load(Ordering::SeqCst)),
            error: None,
        });

        match self.volume_snapshots.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SnapshotError::AlreadyExists {
                kind: KIND_VOLUME_SNAPSHOT,
                key,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn delete_volume_snapshot(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.volume_snapshots.remove(key).is_some())
    }
}

#[async_trait]
impl SnapshotRequestStore for InMemoryCluster {
    async fn get_request(&self, key: &ObjectKey) -> Result<Option<SnapshotRequest>> {
        Ok(self.request(key))
    }

    async fn list_requests(&self, namespace: Option<&str>) -> Result<Vec<SnapshotRequest>> {
        let mut requests: Vec<_> = self
            .requests
            .iter()
            .filter(|e| in_namespace(&e.meta, namespace))
            .map(|e| e.value().clone())
            .collect();
        requests.sort_by(|a, b| {
            a.meta
                .creation_timestamp
                .cmp(&b.meta.creation_timestamp)
                .then_with(|| a.meta.key().cmp(&b.meta.key()))
        });
        Ok(requests)
    }

    async fn create_request(&self, request: &SnapshotRequest) -> Result<SnapshotRequest> {
        let key = request.meta.key();
        let mut stored = request.clone();
        self.init_meta(&mut stored.meta);
        match self.requests.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SnapshotError::AlreadyExists {
                kind: KIND_REQUEST,
                key,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update_request(&self, request: &SnapshotRequest) -> Result<Option<SnapshotRequest>> {
        let key = request.meta.key();
        let kept = {
            let mut entry = self
                .requests
                .get_mut(&key)
                .ok_or_else(|| SnapshotError::not_found(KIND_REQUEST, &key))?;
            if entry.meta.resource_version != request.meta.resource_version {
                return Err(conflict(
                    KIND_REQUEST,
                    &key,
                    request.meta.resource_version,
                    entry.meta.resource_version,
                ));
            }
            if entry.spec != request.spec {
                entry.meta.generation += 1;
            }
            entry.spec = request.spec.clone();
            entry.meta.labels = request.meta.labels.clone();
            entry.meta.annotations = request.meta.annotations.clone();
            entry.meta.finalizers = request.meta.finalizers.clone();
            entry.meta.resource_version = self.next_version();
            if entry.meta.is_deleting() && entry.meta.finalizers.is_empty() {
                None
            } else {
                Some(entry.clone())
            }
        };
        match kept {
            Some(updated) => Ok(Some(updated)),
            None => {
                self.requests.remove(&key);
                Ok(None)
            }
        }
    }

    async fn update_request_status(&self, request: &SnapshotRequest) -> Result<SnapshotRequest> {
        let key = request.meta.key();
        let mut entry = self
            .requests
            .get_mut(&key)
            .ok_or_else(|| SnapshotError::not_found(KIND_REQUEST, &key))?;
        if entry.meta.resource_version != request.meta.resource_version {
            return Err(conflict(
                KIND_REQUEST,
                &key,
                request.meta.resource_version,
                entry.meta.resource_version,
            ));
        }
        entry.status = request.status.clone();
        entry.meta.resource_version = self.next_version();
        Ok(entry.clone())
    }

    async fn delete_request(&self, key: &ObjectKey) -> Result<bool> {
        let now = self.now();
        let remove = match self.requests.get_mut(key) {
            None => return Ok(false),
            Some(mut entry) => {
                if entry.meta.finalizers.is_empty() {
                    true
                } else {
                    if entry.meta.deletion_timestamp.is_none() {
                        entry.meta.deletion_timestamp = Some(now);
                        entry.meta.resource_version = self.next_version();
                    }
                    false
                }
            }
        };
        if remove {
            self.requests.remove(key);
        }
        Ok(true)
    }
}

#[async_trait]
impl ContentStore for InMemoryCluster {
    async fn get_content(&self, key: &ObjectKey) -> Result<Option<SnapshotContent>> {
        Ok(self.content(key))
    }

    async fn list_contents(&self, namespace: Option<&str>) -> Result<Vec<SnapshotContent>> {
        let mut contents: Vec<_> = self
            .contents
            .iter()
            .filter(|e| in_namespace(&e.meta, namespace))
            .map(|e| e.value().clone())
            .collect();
        contents.sort_by(|a, b| a.meta.key().cmp(&b.meta.key()));
        Ok(contents)
    }

    async fn create_content(&self, content: &SnapshotContent) -> Result<SnapshotContent> {
        let key = content.meta.key();
        self.counters.content_create.fetch_add(1, Ordering::SeqCst);
        let mut stored = content.clone();
        self.init_meta(&mut stored.meta);
        match self.contents.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SnapshotError::AlreadyExists {
                kind: KIND_CONTENT,
                key,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update_content_status(&self, content: &SnapshotContent) -> Result<SnapshotContent> {
        let key = content.meta.key();
        let mut entry = self
            .contents
            .get_mut(&key)
            .ok_or_else(|| SnapshotError::not_found(KIND_CONTENT, &key))?;
        if entry.meta.resource_version != content.meta.resource_version {
            return Err(conflict(
                KIND_CONTENT,
                &key,
                content.meta.resource_version,
                entry.meta.resource_version,
            ));
        }
        if entry.spec != content.spec {
            return Err(SnapshotError::Immutable {
                kind: KIND_CONTENT,
                key,
                field: "spec",
            });
        }
        entry.status = content.status.clone();
        entry.meta.resource_version = self.next_version();
        Ok(entry.clone())
    }

    async fn delete_content(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.contents.remove(key).is_some())
    }
}

impl EventRecorder for InMemoryCluster {
    fn record(&self, event: Event) {
        debug!(
            object = %event.object,
            reason = %event.reason,
            message = %event.message,
            "event recorded"
        );
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
