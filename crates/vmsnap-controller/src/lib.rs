#![warn(missing_docs)]

//! vmsnap controller: point-in-time, application-consistent VM snapshots
//!
//! This crate drives a snapshot request through source locking, guest
//! filesystem freeze/thaw, per-volume storage-engine snapshots, failure
//! deadline enforcement and immutable content materialization. All
//! collaborators sit behind the traits in [`ports`]; [`memory`] provides an
//! in-process cluster implementing every one of them.

pub mod cli;
pub mod clock;
pub mod config;
pub mod content;
pub mod controller;
pub mod deadline;
pub mod error;
pub mod freeze;
pub mod lock;
pub mod memory;
pub mod ports;
pub mod reconciler;
pub mod retry;
pub mod scenario;
pub mod selection;
pub mod state;
pub mod status;
pub mod types;
pub mod volume_snapshot;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ControllerConfig, LogFormat};
pub use content::{content_name, ContentMaterializer};
pub use controller::{Controller, PassReport};
pub use deadline::FailureDeadline;
pub use error::{Result, SnapshotError};
pub use freeze::{FreezeCoordinator, FreezeOutcome};
pub use lock::{LockOutcome, SourceLockManager};
pub use memory::InMemoryCluster;
pub use ports::Ports;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use retry::{retry_on_conflict, RetryConfig};
pub use selection::{VolumeKind, VolumeSelection, VolumeSelector};
pub use state::{Activity, Phase, Stage};
pub use status::StatusReconstructor;
pub use types::*;
pub use volume_snapshot::{volume_snapshot_name, VolumeSnapshotDriver, VolumeSnapshotReport};
