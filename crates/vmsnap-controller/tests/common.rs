//! Shared fixtures for scenario-file integration tests.

use serde_json::{json, Value};
use std::io::Write;
use tempfile::NamedTempFile;

/// A running VM with a snapshot-capable root disk, a data disk on a class
/// without snapshot support, and a cloud-init seed.
pub fn mixed_vm_scenario() -> Value {
    json!({
        "storageClasses": [
            {"name": "csi-rbd", "snapshotClass": "csi-rbd-snap"},
            {"name": "local-path"}
        ],
        "claims": [
            {"meta": {"namespace": "prod", "name": "db-root"},
             "spec": {"storage_class": "csi-rbd", "requested_bytes": 10737418240u64},
             "phase": "Bound"},
            {"meta": {"namespace": "prod", "name": "db-scratch"},
             "spec": {"storage_class": "local-path"},
             "phase": "Bound"}
        ],
        "vms": [
            {"meta": {"namespace": "prod", "name": "db"},
             "spec": {
                "run_strategy": "Always",
                "volumes": [
                    {"name": "root", "source": {"dataVolume": {"name": "db-root"}}},
                    {"name": "scratch", "source": {"persistentVolumeClaim": {"claim_name": "db-scratch"}}},
                    {"name": "seed", "source": {"cloudInitNoCloud": {"user_data": "#cloud-config"}}}
                ]
             }}
        ],
        "instances": [
            {"meta": {"namespace": "prod", "name": "db"},
             "phase": "Running",
             "agent_connected": true}
        ],
        "requests": [
            {"namespace": "prod", "name": "nightly", "source": "db"}
        ]
    })
}

/// Writes `scenario` to a temporary `.json` file.
pub fn write_scenario(scenario: &Value) -> NamedTempFile {
    let mut file = NamedTempFile::with_suffix(".json").unwrap();
    file.write_all(serde_json::to_string_pretty(scenario).unwrap().as_bytes())
        .unwrap();
    file
}
