//! Collaborator interfaces.
//!
//! These traits are the seams between the snapshot orchestrator and the
//! outside world: the VM store, the guest agent, claim and storage-class
//! lookup, the storage engine's snapshot objects, and the request/content
//! stores the orchestrator exposes. Every update is a compare-and-swap on
//! the object's `resource_version` and fails with
//! [`SnapshotError::Conflict`](crate::error::SnapshotError::Conflict) when
//! the object changed since it was read.

use async_trait::async_trait;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Result;
use crate::types::{
    Event, ObjectKey, PersistentVolumeClaim, SnapshotContent, SnapshotRequest, VirtualMachine,
    VmInstance, VolumeSnapshot,
};

/// Virtual machine and instance lookup.
#[async_trait]
pub trait VmApi: Send + Sync {
    /// Fetches a VM; `None` if absent.
    async fn get_vm(&self, key: &ObjectKey) -> Result<Option<VirtualMachine>>;

    /// Lists VMs, optionally restricted to one namespace.
    async fn list_vms(&self, namespace: Option<&str>) -> Result<Vec<VirtualMachine>>;

    /// Replaces a VM's metadata and status, conditioned on its resource version.
    ///
    /// Returns the stored object with its new resource version.
    async fn update_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;

    /// Fetches the running instance of a VM; `None` if it is not running.
    async fn get_instance(&self, key: &ObjectKey) -> Result<Option<VmInstance>>;
}

/// Guest agent commands.
///
/// A failure to reach the agent is
/// [`SnapshotError::GuestTransport`](crate::error::SnapshotError::GuestTransport);
/// a failure reported by the guest is
/// [`SnapshotError::GuestCommand`](crate::error::SnapshotError::GuestCommand).
#[async_trait]
pub trait GuestAgent: Send + Sync {
    /// Freezes guest filesystems.
    async fn freeze(&self, instance: &ObjectKey) -> Result<()>;

    /// Thaws guest filesystems.
    async fn thaw(&self, instance: &ObjectKey) -> Result<()>;
}

/// Persistent volume claim lookup.
#[async_trait]
pub trait ClaimApi: Send + Sync {
    /// Fetches a claim; `None` if absent.
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>>;
}

/// Storage-class snapshot capability lookup.
#[async_trait]
pub trait StorageClassCatalog: Send + Sync {
    /// Returns the snapshot class serving `storage_class`, or `None` if the
    /// class cannot take volume snapshots.
    async fn snapshot_class_for(&self, storage_class: &str) -> Result<Option<String>>;
}

/// Storage-engine snapshot objects.
#[async_trait]
pub trait VolumeSnapshotApi: Send + Sync {
    /// Fetches a snapshot object; `None` if absent.
    async fn get_volume_snapshot(&self, key: &ObjectKey) -> Result<Option<VolumeSnapshot>>;

    /// Creates a snapshot object.
    ///
    /// Fails with `AlreadyExists` if the name is taken and `Rejected` if the
    /// engine refuses the request.
    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;

    /// Deletes a snapshot object; returns false if it was already gone.
    async fn delete_volume_snapshot(&self, key: &ObjectKey) -> Result<bool>;
}

/// Snapshot request store.
#[async_trait]
pub trait SnapshotRequestStore: Send + Sync {
    /// Fetches a request; `None` if absent.
    async fn get_request(&self, key: &ObjectKey) -> Result<Option<SnapshotRequest>>;

    /// Lists requests, optionally restricted to one namespace.
    async fn list_requests(&self, namespace: Option<&str>) -> Result<Vec<SnapshotRequest>>;

    /// Creates a request; the store assigns uid, versions and timestamps.
    async fn create_request(&self, request: &SnapshotRequest) -> Result<SnapshotRequest>;

    /// Replaces a request's metadata and spec, leaving status untouched.
    ///
    /// When the update clears the last finalizer of an object marked for
    /// deletion, the object is removed and `None` is returned.
    async fn update_request(&self, request: &SnapshotRequest) -> Result<Option<SnapshotRequest>>;

    /// Replaces a request's status, leaving metadata and spec untouched.
    async fn update_request_status(&self, request: &SnapshotRequest) -> Result<SnapshotRequest>;

    /// Requests deletion: marks the object if finalizers remain, removes it
    /// otherwise. Returns false if it was already gone.
    async fn delete_request(&self, key: &ObjectKey) -> Result<bool>;
}

/// Snapshot content store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetches a content artifact; `None` if absent.
    async fn get_content(&self, key: &ObjectKey) -> Result<Option<SnapshotContent>>;

    /// Lists content artifacts, optionally restricted to one namespace.
    async fn list_contents(&self, namespace: Option<&str>) -> Result<Vec<SnapshotContent>>;

    /// Creates a content artifact; `AlreadyExists` if the name is taken.
    async fn create_content(&self, content: &SnapshotContent) -> Result<SnapshotContent>;

    /// Replaces a content artifact's status. Fails with `Immutable` if the
    /// spec differs from the stored one.
    async fn update_content_status(&self, content: &SnapshotContent) -> Result<SnapshotContent>;

    /// Deletes a content artifact; returns false if it was already gone.
    async fn delete_content(&self, key: &ObjectKey) -> Result<bool>;
}

/// Event sink.
pub trait EventRecorder: Send + Sync {
    /// Records an event.
    fn record(&self, event: Event);
}

/// Bundle of collaborator handles shared by every component.
#[derive(Clone)]
pub struct Ports {
    /// VM and instance lookup.
    pub vms: Arc<dyn VmApi>,
    /// Guest agent.
    pub guest: Arc<dyn GuestAgent>,
    /// Claim lookup.
    pub claims: Arc<dyn ClaimApi>,
    /// Storage-class capability lookup.
    pub storage_classes: Arc<dyn StorageClassCatalog>,
    /// Storage-engine snapshot objects.
    pub volume_snapshots: Arc<dyn VolumeSnapshotApi>,
    /// Snapshot requests.
    pub requests: Arc<dyn SnapshotRequestStore>,
    /// Content artifacts.
    pub contents: Arc<dyn ContentStore>,
    /// Event sink.
    pub events: Arc<dyn EventRecorder>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}
