//! Error types for snapshot orchestration.

use thiserror::Error;

use crate::state::Stage;
use crate::types::ObjectKey;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Error variants for snapshot orchestration and its collaborators.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },

    /// Optimistic-concurrency conflict: the object changed since it was read.
    #[error("conflict updating {kind} {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
        /// Resource version the writer read.
        expected: u64,
        /// Resource version currently stored.
        actual: u64,
    },

    /// An object with this name already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },

    /// The store or an admission check refused the write.
    #[error("{kind} {key} rejected: {reason}")]
    Rejected {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
        /// Why the write was refused.
        reason: String,
    },

    /// Attempted to change a write-once field.
    #[error("{kind} {key} is immutable: {field} cannot change")]
    Immutable {
        /// Object kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
        /// Field that was modified.
        field: &'static str,
    },

    /// The guest agent could not be reached at all.
    #[error("guest agent transport error for {key}: {reason}")]
    GuestTransport {
        /// Instance key.
        key: ObjectKey,
        /// Transport failure description.
        reason: String,
    },

    /// The guest agent was reached but reported a command failure.
    #[error("{message}")]
    GuestCommand {
        /// Guest-reported failure text.
        message: String,
    },

    /// State-machine edge not in the transition table.
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// Current stage.
        from: Stage,
        /// Requested stage.
        to: Stage,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SnapshotError {
    /// Shorthand for [`SnapshotError::NotFound`].
    pub fn not_found(kind: &'static str, key: &ObjectKey) -> Self {
        SnapshotError::NotFound {
            kind,
            key: key.clone(),
        }
    }

    /// True for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SnapshotError::Conflict { .. })
    }

    /// True if the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound { .. })
    }

    /// True if the object already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, SnapshotError::AlreadyExists { .. })
    }

    /// True if the same call may succeed when retried later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SnapshotError::Conflict { .. }
                | SnapshotError::Rejected { .. }
                | SnapshotError::GuestTransport { .. }
                | SnapshotError::GuestCommand { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retriable() {
        let err = SnapshotError::Conflict {
            kind: "VirtualMachine",
            key: ObjectKey::new("ns", "vm"),
            expected: 3,
            actual: 4,
        };
        assert!(err.is_conflict());
        assert!(err.is_retriable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_display() {
        let err = SnapshotError::not_found("VirtualMachine", &ObjectKey::new("ns", "vm"));
        assert_eq!(err.to_string(), "VirtualMachine ns/vm not found");
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_guest_command_display_is_raw_message() {
        let err = SnapshotError::GuestCommand {
            message: "command Freeze failed: fs busy".to_string(),
        };
        assert_eq!(err.to_string(), "command Freeze failed: fs busy");
    }

    #[test]
    fn test_illegal_transition_display() {
        let err = SnapshotError::IllegalTransition {
            from: Stage::Succeeded,
            to: Stage::Freezing,
        };
        assert!(err.to_string().contains("Succeeded"));
    }
}
