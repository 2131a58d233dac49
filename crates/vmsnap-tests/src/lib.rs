//! vmsnap Test & Validation Infrastructure
//!
//! Scenario suites that drive the snapshot controller against the in-memory
//! cluster on a manual clock: lifecycle, failure deadline, freeze/thaw
//! pairing, volume selection, source leases and status recovery.

pub mod harness;
pub mod selection_tests;

pub use harness::{TestEnv, NS, PLAIN_CLASS, SNAP_CLASS};
