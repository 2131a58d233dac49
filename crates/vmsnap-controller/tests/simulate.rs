//! End-to-end runs of scenario files through the controller.

mod common;

use common::{mixed_vm_scenario, write_scenario};
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;
use vmsnap_controller::content::EVENT_CONTENT_CREATED;
use vmsnap_controller::reconciler::{EVENT_FREEZE_ERROR, EVENT_SNAPSHOT_FAILED};
use vmsnap_controller::scenario::{self, Scenario};
use vmsnap_controller::volume_snapshot::EVENT_VOLUME_SNAPSHOT_CREATED;
use vmsnap_controller::{ControllerConfig, Phase, Stage};

fn reasons(report: &scenario::ScenarioReport) -> Vec<String> {
    report.events.iter().map(|e| e.reason.clone()).collect()
}

#[tokio::test]
async fn test_online_snapshot_with_mixed_volumes() {
    let file = write_scenario(&mixed_vm_scenario());
    let scenario = Scenario::from_file(file.path()).unwrap();
    let report = scenario::run(&scenario, ControllerConfig::default(), 20)
        .await
        .unwrap();

    assert!(report.settled);
    let nightly = &report.requests[0];
    assert_eq!(nightly.phase, Phase::Succeeded);
    assert_eq!(nightly.stage, Stage::Succeeded);
    assert!(nightly.ready_to_use);
    assert!(nightly.error.is_none());
    assert_eq!(nightly.included, vec!["root".to_string()]);
    assert_eq!(
        nightly.excluded,
        vec!["scratch".to_string(), "seed".to_string()]
    );

    let reasons = reasons(&report);
    assert!(reasons.contains(&EVENT_CONTENT_CREATED.to_string()));
    assert!(reasons.contains(&EVENT_VOLUME_SNAPSHOT_CREATED.to_string()));
}

#[tokio::test]
async fn test_freeze_failure_fails_at_deadline() {
    let mut doc = mixed_vm_scenario();
    doc["faults"] = json!({"freezeFailure": "command Freeze failed: fsfreeze busy"});
    doc["requests"][0]["failureDeadlineSecs"] = json!(5);
    let file = write_scenario(&doc);
    let scenario = Scenario::from_file(file.path()).unwrap();

    let report = scenario::run(&scenario, ControllerConfig::default(), 20)
        .await
        .unwrap();

    assert!(report.settled);
    let nightly = &report.requests[0];
    assert_eq!(nightly.phase, Phase::Failed);
    assert!(nightly.content_name.is_none());
    let reasons = reasons(&report);
    assert!(reasons.contains(&EVENT_FREEZE_ERROR.to_string()));
    assert_eq!(
        reasons.iter().filter(|r| *r == EVENT_SNAPSHOT_FAILED).count(),
        1
    );
}

#[tokio::test]
async fn test_denied_volume_snapshots_report_error_until_deadline() {
    let mut doc = mixed_vm_scenario();
    doc["faults"] = json!({"denyVolumeSnapshotsFor": ["db"]});
    doc["requests"][0]["failureDeadlineSecs"] = json!(10);
    let file = write_scenario(&doc);
    let scenario = Scenario::from_file(file.path()).unwrap();

    let report = scenario::run(&scenario, ControllerConfig::default(), 5)
        .await
        .unwrap();
    assert!(!report.settled);
    let nightly = &report.requests[0];
    assert_eq!(nightly.phase, Phase::InProgress);
    assert!(nightly
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("Failed to create VolumeSnapshot"));

    let report = scenario::run(&scenario, ControllerConfig::default(), 20)
        .await
        .unwrap();
    assert!(report.settled);
    assert_eq!(report.requests[0].phase, Phase::Failed);
}

#[tokio::test]
async fn test_config_file_drives_resync_interval() {
    let mut config_file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(config_file, "resync_interval_ms = 2000\nworkers = 1").unwrap();
    let config = ControllerConfig::from_file(config_file.path()).unwrap();

    let mut doc = mixed_vm_scenario();
    doc["faults"] = json!({"volumeSnapshotsReady": false});
    doc["requests"][0]["failureDeadlineSecs"] = json!(6);
    let file = write_scenario(&doc);
    let scenario = Scenario::from_file(file.path()).unwrap();

    let report = scenario::run(&scenario, config, 20).await.unwrap();
    assert!(report.settled);
    assert_eq!(report.requests[0].phase, Phase::Failed);
    // Passes at t=0, 2, 4 stay in progress; the pass at t=6 fails.
    assert_eq!(report.steps, 4);
}
