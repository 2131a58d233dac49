//! Source lock manager.
//!
//! Serializes snapshot and restore operations against one VM through a
//! single-writer lease stored in the VM status. The lease is taken with a
//! compare-and-swap on the VM's resource version, so two reconcilers racing
//! for the same VM cannot both win. The lease also captures the VM spec and
//! identity as seen by that compare-and-swap.
//!
//! Crash recovery needs no separate bookkeeping: a snapshot lease whose
//! holder request is gone, was recreated under a new uid, or is terminal is
//! stale and may be taken over.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ports::Ports;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::state::REASON_SOURCE_MISSING;
use crate::types::{
    CapturedSource, LeaseKind, ObjectKey, SnapshotRequest, SourceLease,
    SOURCE_PROTECTION_FINALIZER,
};

/// Why the lease could not be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The source VM does not exist.
    SourceMissing,
    /// An included volume's claim is not bound.
    VolumeNotBound {
        /// Volume name.
        volume: String,
    },
    /// Another live operation holds the lease.
    HeldBy {
        /// Holder kind.
        kind: LeaseKind,
        /// Holder name.
        holder: String,
    },
}

impl BlockReason {
    /// Condition reason text for a request on `source`.
    pub fn message(&self, source: &ObjectKey) -> String {
        match self {
            BlockReason::SourceMissing => REASON_SOURCE_MISSING.to_string(),
            BlockReason::VolumeNotBound { .. } => {
                format!("Source not locked source {} volume not bound", source)
            }
            BlockReason::HeldBy { holder, .. } => {
                format!("Source not locked source {} locked by {}", source, holder)
            }
        }
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// The request holds the lease.
    Held(SourceLease),
    /// The request must wait.
    Blocked(BlockReason),
}

/// Acquires and releases source leases.
#[derive(Debug, Clone)]
pub struct SourceLockManager {
    ports: Ports,
    retry: RetryConfig,
}

impl SourceLockManager {
    /// Creates a lock manager.
    pub fn new(ports: Ports, retry: RetryConfig) -> Self {
        Self { ports, retry }
    }

    /// Takes the lease on the request's source VM, or reports why not.
    ///
    /// `unbound_volume` names an included volume whose claim is not yet
    /// bound; the lease is not taken while one exists. Re-acquiring a lease
    /// the request already holds returns it unchanged.
    pub async fn acquire(
        &self,
        request: &SnapshotRequest,
        unbound_volume: Option<&str>,
    ) -> Result<LockOutcome> {
        retry_on_conflict(&self.retry, move || self.try_acquire(request, unbound_volume)).await
    }

    async fn try_acquire(
        &self,
        request: &SnapshotRequest,
        unbound_volume: Option<&str>,
    ) -> Result<LockOutcome> {
        let source = request.source_key();
        let Some(mut vm) = self.ports.vms.get_vm(&source).await? else {
            return Ok(LockOutcome::Blocked(BlockReason::SourceMissing));
        };

        if let Some(lease) = &vm.status.source_lease {
            if lease.holder_uid == request.meta.uid {
                return Ok(LockOutcome::Held(lease.clone()));
            }
            if !self.is_stale(lease, &source).await? {
                debug!(
                    request = %request.meta.key(),
                    holder = %lease.holder,
                    "source lease held by another operation"
                );
                return Ok(LockOutcome::Blocked(BlockReason::HeldBy {
                    kind: lease.kind,
                    holder: lease.holder.clone(),
                }));
            }
            warn!(
                vm = %source,
                stale_holder = %lease.holder,
                request = %request.meta.key(),
                "taking over stale source lease"
            );
        }

        if let Some(volume) = unbound_volume {
            return Ok(LockOutcome::Blocked(BlockReason::VolumeNotBound {
                volume: volume.to_string(),
            }));
        }

        let lease = SourceLease {
            kind: LeaseKind::Snapshot,
            holder: request.meta.name.clone(),
            holder_uid: request.meta.uid.clone(),
            acquired_at: self.ports.clock.now(),
            captured: CapturedSource::of(&vm),
        };
        vm.status.source_lease = Some(lease.clone());
        vm.meta.add_finalizer(SOURCE_PROTECTION_FINALIZER);
        self.ports.vms.update_vm(&vm).await?;

        info!(
            vm = %source,
            request = %request.meta.key(),
            generation = lease.captured.generation,
            "source lease acquired"
        );
        Ok(LockOutcome::Held(lease))
    }

    async fn is_stale(&self, lease: &SourceLease, source: &ObjectKey) -> Result<bool> {
        if lease.kind == LeaseKind::Restore {
            return Ok(false);
        }
        let holder_key = source.sibling(lease.holder.clone());
        let holder = self.ports.requests.get_request(&holder_key).await?;
        Ok(match holder {
            None => true,
            Some(h) => h.meta.uid != lease.holder_uid || h.phase().is_terminal(),
        })
    }

    /// True if `request` currently holds the lease on its source.
    pub async fn holds(&self, request: &SnapshotRequest) -> Result<bool> {
        let vm = self.ports.vms.get_vm(&request.source_key()).await?;
        Ok(vm
            .and_then(|vm| vm.status.source_lease)
            .map(|lease| lease.holder_uid == request.meta.uid)
            .unwrap_or(false))
    }

    /// Clears the lease if `request` holds it; returns whether it did.
    ///
    /// Safe to call repeatedly.
    pub async fn release(&self, request: &SnapshotRequest) -> Result<bool> {
        retry_on_conflict(&self.retry, move || self.try_release(request)).await
    }

    async fn try_release(&self, request: &SnapshotRequest) -> Result<bool> {
        let source = request.source_key();
        let Some(mut vm) = self.ports.vms.get_vm(&source).await? else {
            return Ok(false);
        };
        let held = vm
            .status
            .source_lease
            .as_ref()
            .map(|lease| lease.holder_uid == request.meta.uid)
            .unwrap_or(false);
        if !held {
            return Ok(false);
        }
        vm.status.source_lease = None;
        vm.meta.remove_finalizer(SOURCE_PROTECTION_FINALIZER);
        self.ports.vms.update_vm(&vm).await?;
        info!(vm = %source, request = %request.meta.key(), "source lease released");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryCluster;
    use crate::ports::SnapshotRequestStore;
    use crate::state::Phase;
    use crate::types::{ObjectMeta, SnapshotRequestStatus, VirtualMachine};
    use std::sync::Arc;

    async fn setup() -> (Arc<InMemoryCluster>, SourceLockManager, SnapshotRequest, SnapshotRequest) {
        let cluster = Arc::new(InMemoryCluster::new(Arc::new(ManualClock::default())));
        cluster.put_vm(VirtualMachine {
            meta: ObjectMeta::new("default", "vm"),
            ..Default::default()
        });
        let a = cluster
            .create_request(&SnapshotRequest::new("default", "snap-a", "vm"))
            .await
            .unwrap();
        let b = cluster
            .create_request(&SnapshotRequest::new("default", "snap-b", "vm"))
            .await
            .unwrap();
        let locks = SourceLockManager::new(cluster.ports(), RetryConfig::default());
        (cluster, locks, a, b)
    }

    #[tokio::test]
    async fn test_second_request_blocked_until_release() {
        let (cluster, locks, a, b) = setup().await;
        assert!(matches!(locks.acquire(&a, None).await.unwrap(), LockOutcome::Held(_)));

        let outcome = locks.acquire(&b, None).await.unwrap();
        let LockOutcome::Blocked(reason) = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(
            reason.message(&ObjectKey::new("default", "vm")),
            "Source not locked source default/vm locked by snap-a"
        );

        let vm = cluster.vm(&ObjectKey::new("default", "vm")).unwrap();
        assert!(vm.meta.has_finalizer(SOURCE_PROTECTION_FINALIZER));

        assert!(locks.release(&a).await.unwrap());
        assert!(!locks.release(&a).await.unwrap());
        let vm = cluster.vm(&ObjectKey::new("default", "vm")).unwrap();
        assert!(!vm.meta.has_finalizer(SOURCE_PROTECTION_FINALIZER));
        assert!(matches!(locks.acquire(&b, None).await.unwrap(), LockOutcome::Held(_)));
    }

    #[tokio::test]
    async fn test_reacquire_is_idempotent() {
        let (_cluster, locks, a, _b) = setup().await;
        let LockOutcome::Held(first) = locks.acquire(&a, None).await.unwrap() else {
            panic!("expected held");
        };
        let LockOutcome::Held(second) = locks.acquire(&a, None).await.unwrap() else {
            panic!("expected held");
        };
        assert_eq!(first, second);
        assert!(locks.holds(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbound_volume_blocks() {
        let (_cluster, locks, a, _b) = setup().await;
        let outcome = locks.acquire(&a, Some("rootdisk")).await.unwrap();
        assert_eq!(
            outcome,
            LockOutcome::Blocked(BlockReason::VolumeNotBound {
                volume: "rootdisk".to_string()
            })
        );
        assert!(!locks.holds(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let (cluster, locks, a, _b) = setup().await;
        cluster.remove_vm(&ObjectKey::new("default", "vm"));
        assert_eq!(
            locks.acquire(&a, None).await.unwrap(),
            LockOutcome::Blocked(BlockReason::SourceMissing)
        );
    }

    #[tokio::test]
    async fn test_stale_lease_taken_over() {
        let (cluster, locks, a, b) = setup().await;
        locks.acquire(&a, None).await.unwrap();

        let mut done = cluster.request(&a.meta.key()).unwrap();
        done.status = Some(SnapshotRequestStatus {
            phase: Phase::Failed,
            ..Default::default()
        });
        cluster.update_request_status(&done).await.unwrap();

        let LockOutcome::Held(lease) = locks.acquire(&b, None).await.unwrap() else {
            panic!("expected takeover");
        };
        assert_eq!(lease.holder, "snap-b");
    }

    #[tokio::test]
    async fn test_lease_of_deleted_holder_is_stale() {
        let (cluster, locks, a, b) = setup().await;
        locks.acquire(&a, None).await.unwrap();
        cluster.delete_request(&a.meta.key()).await.unwrap();
        assert!(matches!(locks.acquire(&b, None).await.unwrap(), LockOutcome::Held(_)));
    }
}
