//! Volume selection through the full controller: include/exclude lists,
//! per-volume VM status, unbound and deleting claims, synthetic volumes.

use crate::harness::{dv, key, pvc, TestEnv, NS, PLAIN_CLASS};
use vmsnap_controller::{
    ClaimPhase, ConditionType, MemoryDumpPhase, MemoryDumpRequest, ObjectMeta, Phase, Stage,
    VirtualMachine, Volume, VolumeSnapshotStatus, VolumeSource,
};

#[tokio::test]
async fn test_include_exclude_lists_and_vm_statuses() {
    let env = TestEnv::new();
    env.bound_claim("root");
    env.claim("scratch", PLAIN_CLASS, ClaimPhase::Bound);
    env.vm(
        "vm",
        vec![
            dv("rootdisk", "root"),
            pvc("scratch", "scratch"),
            pvc("orphan", "does-not-exist"),
            Volume::new(
                "cd",
                VolumeSource::ContainerDisk {
                    image: "quay.io/fedora:40".to_string(),
                },
            ),
        ],
    );
    env.request("snap", "vm").await;
    env.pass().await;

    let status = env.status("snap");
    assert_eq!(status.phase, Phase::Succeeded);
    let volumes = status.snapshot_volumes.unwrap();
    assert_eq!(volumes.included, vec!["rootdisk".to_string()]);
    assert_eq!(
        volumes.excluded,
        vec![
            "scratch".to_string(),
            "orphan".to_string(),
            "cd".to_string()
        ]
    );

    let vm = env.cluster.vm(&key("vm")).unwrap();
    let statuses = vm.status.volume_snapshot_statuses;
    assert_eq!(
        statuses[0],
        VolumeSnapshotStatus {
            name: "rootdisk".to_string(),
            enabled: true,
            reason: None
        }
    );
    assert_eq!(
        statuses[1].reason.as_deref(),
        Some(
            "No VolumeSnapshotClass: Volume snapshots are not configured for this StorageClass [local-path] [scratch]"
        )
    );
    assert_eq!(
        statuses[2].reason.as_deref(),
        Some("PersistentVolumeClaim [does-not-exist] not found for volume [orphan]")
    );
    assert_eq!(
        statuses[3].reason.as_deref(),
        Some("Snapshot is not supported for this volumeSource type [containerDisk]")
    );
}

#[tokio::test]
async fn test_unbound_claim_blocks_lock_until_bound() {
    let env = TestEnv::new();
    env.claim("root", crate::harness::SNAP_CLASS, ClaimPhase::Pending);
    env.vm("vm", vec![dv("rootdisk", "root")]);
    env.request("snap", "vm").await;

    env.run_passes(2).await;
    let status = env.status("snap");
    assert_eq!(status.phase, Phase::InProgress);
    assert_eq!(status.stage, Stage::SourceLocking);
    assert_eq!(
        status.condition(ConditionType::Progressing).unwrap().reason,
        "Source not locked source default/vm volume not bound"
    );
    assert!(env.lease_holder("vm").is_none());
    assert_eq!(env.cluster.content_count(), 0);

    env.bound_claim("root");
    env.pass().await;
    assert_eq!(env.status("snap").phase, Phase::Succeeded);
}

#[tokio::test]
async fn test_deleting_claim_fails_content_creation() {
    let env = TestEnv::new();
    env.simple_vm("vm");
    env.start("vm", true);
    env.cluster.mark_claim_deleting(&key("vm-root")).unwrap();
    env.request("snap", "vm").await;

    env.pass().await;

    let status = env.status("snap");
    assert_eq!(status.phase, Phase::InProgress);
    let message = status.error.and_then(|e| e.message).unwrap_or_default();
    assert!(message.starts_with("Failed to create snapshot content with error:"));
    assert!(message.contains("is being deleted"));
    assert_eq!(env.cluster.content_count(), 0);
    assert!(!env.is_frozen("vm"));
    assert_eq!(
        env.cluster.counters().freezes(),
        env.cluster.counters().thaws()
    );
}

#[tokio::test]
async fn test_backend_state_claim_is_included() {
    let env = TestEnv::new();
    env.bound_claim("root");
    env.bound_claim("persistent-state-for-vm");
    let mut vm = VirtualMachine {
        meta: ObjectMeta::new(NS, "vm"),
        ..Default::default()
    };
    vm.spec.volumes = vec![dv("rootdisk", "root")];
    vm.spec.persistent_state = true;
    env.cluster.put_vm(vm);
    env.request("snap", "vm").await;

    env.pass().await;

    let volumes = env.status("snap").snapshot_volumes.unwrap();
    assert_eq!(
        volumes.included,
        vec!["rootdisk".to_string(), "persistent-state-for-vm".to_string()]
    );
    let content = env.content_for("snap").unwrap();
    assert_eq!(content.spec.volume_backups.len(), 2);
    assert_eq!(content.spec.volume_backups[1].claim.name, "persistent-state-for-vm");
}

#[tokio::test]
async fn test_memory_dump_included_only_when_completed() {
    let env = TestEnv::new();
    env.bound_claim("root");
    env.bound_claim("dump");
    let mut vm = VirtualMachine {
        meta: ObjectMeta::new(NS, "vm"),
        ..Default::default()
    };
    vm.spec.volumes = vec![
        dv("rootdisk", "root"),
        Volume::new(
            "memdump",
            VolumeSource::MemoryDump {
                claim_name: "dump".to_string(),
            },
        ),
    ];
    vm.status.memory_dump = Some(MemoryDumpRequest {
        claim_name: "dump".to_string(),
        phase: MemoryDumpPhase::InProgress,
    });
    env.cluster.put_vm(vm.clone());
    env.request("first", "vm").await;
    env.pass().await;
    assert_eq!(
        env.status("first").snapshot_volumes.unwrap().excluded,
        vec!["memdump".to_string()]
    );

    vm.status.memory_dump = Some(MemoryDumpRequest {
        claim_name: "dump".to_string(),
        phase: MemoryDumpPhase::Completed,
    });
    env.cluster.put_vm(vm);
    env.request("second", "vm").await;
    env.pass().await;
    assert_eq!(
        env.status("second").snapshot_volumes.unwrap().included,
        vec!["rootdisk".to_string(), "memdump".to_string()]
    );
}

#[tokio::test]
async fn test_temporary_hotplug_volume_is_excluded() {
    let env = TestEnv::new();
    env.simple_vm("vm");
    env.bound_claim("hot");
    env.start("vm", true);
    let mut instance = env.cluster.instance(&key("vm")).unwrap();
    instance.temporary_volumes = vec![Volume::new(
        "hotdisk",
        VolumeSource::PersistentVolumeClaim {
            claim_name: "hot".to_string(),
            hotpluggable: true,
        },
    )];
    env.cluster.put_instance(instance);
    env.request("snap", "vm").await;

    env.pass().await;

    let volumes = env.status("snap").snapshot_volumes.unwrap();
    assert_eq!(volumes.included, vec!["rootdisk".to_string()]);
    assert_eq!(volumes.excluded, vec!["hotdisk".to_string()]);
    let vm = env.cluster.vm(&key("vm")).unwrap();
    assert_eq!(
        vm.status.volume_snapshot_statuses[1].reason.as_deref(),
        Some("Volume [hotdisk] is a temporary hotplug volume")
    );
}
