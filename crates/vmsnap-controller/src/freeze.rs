//! Guest freeze coordinator.
//!
//! Freeze is issued only to a running instance with a connected guest agent
//! that is not already frozen. A freeze the guest reports as failed is
//! followed by a best-effort thaw, so every freeze call is paired with a
//! thaw call.

use tracing::{info, warn};

use crate::error::{Result, SnapshotError};
use crate::ports::Ports;
use crate::types::{Indication, ObjectKey, VmInstance};

/// Result of a freeze attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeOutcome {
    /// Filesystems were frozen by this call.
    Frozen,
    /// Filesystems were already frozen.
    AlreadyFrozen,
    /// No running instance or no guest agent; nothing to freeze.
    NotApplicable,
    /// The guest reported a failure.
    CommandFailed {
        /// Guest-reported failure text.
        message: String,
    },
}

/// Indications describing how a snapshot of this instance is taken.
pub fn indications_for(instance: Option<&VmInstance>) -> Vec<Indication> {
    match instance {
        Some(i) if i.is_running() => {
            let agent = if i.agent_connected {
                Indication::GuestAgent
            } else {
                Indication::NoGuestAgent
            };
            vec![agent, Indication::Online]
        }
        _ => Vec::new(),
    }
}

/// Issues freeze and thaw to the guest agent.
#[derive(Debug, Clone)]
pub struct FreezeCoordinator {
    ports: Ports,
}

impl FreezeCoordinator {
    /// Creates a coordinator.
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Freezes the instance if it can and is not already frozen.
    ///
    /// Transport errors propagate; guest-reported failures become
    /// [`FreezeOutcome::CommandFailed`].
    pub async fn freeze(&self, key: &ObjectKey) -> Result<FreezeOutcome> {
        let Some(instance) = self.ports.vms.get_instance(key).await? else {
            return Ok(FreezeOutcome::NotApplicable);
        };
        if !instance.can_freeze() {
            return Ok(FreezeOutcome::NotApplicable);
        }
        if instance.is_frozen() {
            return Ok(FreezeOutcome::AlreadyFrozen);
        }

        match self.ports.guest.freeze(key).await {
            Ok(()) => {
                info!(instance = %key, "guest filesystems frozen");
                Ok(FreezeOutcome::Frozen)
            }
            Err(SnapshotError::GuestCommand { message }) => {
                warn!(instance = %key, error = %message, "freeze failed, thawing");
                if let Err(e) = self.ports.guest.thaw(key).await {
                    warn!(instance = %key, error = %e, "thaw after failed freeze failed");
                }
                Ok(FreezeOutcome::CommandFailed { message })
            }
            Err(e) => Err(e),
        }
    }

    /// Thaws the instance if it is frozen; returns whether a thaw was issued.
    pub async fn thaw_if_frozen(&self, key: &ObjectKey) -> Result<bool> {
        let Some(instance) = self.ports.vms.get_instance(key).await? else {
            return Ok(false);
        };
        if !instance.is_frozen() {
            return Ok(false);
        }
        self.ports.guest.thaw(key).await?;
        info!(instance = %key, "guest filesystems thawed");
        Ok(true)
    }
}
