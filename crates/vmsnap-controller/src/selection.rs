//! Volume selection engine.
//!
//! Classifies each VM volume into a [`VolumeKind`] and decides, with a single
//! predicate, whether it is snapshotted. Template volumes come first in
//! template order, followed by synthetic volumes: the backend state claim,
//! then temporary hotplug volumes of the running instance.

use tracing::debug;

use crate::error::Result;
use crate::ports::Ports;
use crate::types::{
    MemoryDumpPhase, ObjectKey, PersistentVolumeClaim, SnapshotVolumeLists, VirtualMachine,
    VmInstance, Volume, VolumeSnapshotStatus, VolumeSource,
};

/// Storage facts about a claim-backed volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    /// The claim does not exist.
    Missing {
        /// Claim name.
        claim_name: String,
    },
    /// The claim exists.
    Found {
        /// The claim.
        claim: Box<PersistentVolumeClaim>,
        /// Whether its storage class has a snapshot class.
        snapshot_capable: bool,
    },
}

/// A volume classified for snapshotting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKind {
    /// Data volume or plain claim.
    Claim(ClaimState),
    /// Claim holding a memory dump.
    MemoryDump {
        /// Backing claim.
        claim: ClaimState,
        /// Whether the dump finished.
        completed: bool,
    },
    /// Backend persistent-state claim (TPM/EFI).
    BackendState(ClaimState),
    /// Volume hotplugged into the running instance only.
    TemporaryHotplug,
    /// Source type that has no claim to snapshot.
    Unsupported {
        /// Source type name.
        source_type: &'static str,
    },
}

/// Outcome of the inclusion predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Snapshot this volume's claim.
    Include(Box<PersistentVolumeClaim>),
    /// Leave the volume out, for this reason.
    Exclude(String),
}

impl VolumeKind {
    /// The single inclusion predicate.
    pub fn decide(&self, volume_name: &str) -> Decision {
        match self {
            VolumeKind::Unsupported { source_type } => Decision::Exclude(format!(
                "Snapshot is not supported for this volumeSource type [{}]",
                source_type
            )),
            VolumeKind::TemporaryHotplug => Decision::Exclude(format!(
                "Volume [{}] is a temporary hotplug volume",
                volume_name
            )),
            VolumeKind::MemoryDump {
                completed: false, ..
            } => Decision::Exclude(format!(
                "Memory dump in volume [{}] is not completed",
                volume_name
            )),
            VolumeKind::Claim(state)
            | VolumeKind::BackendState(state)
            | VolumeKind::MemoryDump { claim: state, .. } => decide_claim(state, volume_name),
        }
    }
}

fn decide_claim(state: &ClaimState, volume_name: &str) -> Decision {
    match state {
        ClaimState::Missing { claim_name } => Decision::Exclude(format!(
            "PersistentVolumeClaim [{}] not found for volume [{}]",
            claim_name, volume_name
        )),
        ClaimState::Found {
            claim,
            snapshot_capable: false,
        } => Decision::Exclude(format!(
            "No VolumeSnapshotClass: Volume snapshots are not configured for this StorageClass [{}] [{}]",
            claim.spec.storage_class.as_deref().unwrap_or_default(),
            volume_name
        )),
        ClaimState::Found { claim, .. } => Decision::Include(claim.clone()),
    }
}

/// An included volume and its claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedVolume {
    /// The VM volume (synthetic for backend state).
    pub volume: Volume,
    /// The claim backing it.
    pub claim: PersistentVolumeClaim,
}

/// Result of selecting volumes for one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSelection {
    /// Included volumes, template order then synthetic.
    pub included: Vec<SelectedVolume>,
    /// Excluded volume names, same ordering.
    pub excluded: Vec<String>,
    /// Per-volume status, same ordering, covering every volume.
    pub statuses: Vec<VolumeSnapshotStatus>,
}

impl VolumeSelection {
    /// Included volume names.
    pub fn included_names(&self) -> Vec<String> {
        self.included.iter().map(|v| v.volume.name.clone()).collect()
    }

    /// Included and excluded name lists.
    pub fn lists(&self) -> SnapshotVolumeLists {
        SnapshotVolumeLists {
            included: self.included_names(),
            excluded: self.excluded.clone(),
        }
    }

    /// First included volume whose claim is not bound.
    pub fn first_unbound(&self) -> Option<&SelectedVolume> {
        self.included.iter().find(|v| !v.claim.is_bound())
    }

    /// Pushes a classified volume.
    pub fn push(&mut self, volume: Volume, kind: &VolumeKind) {
        match kind.decide(&volume.name) {
            Decision::Include(claim) => {
                self.statuses.push(VolumeSnapshotStatus {
                    name: volume.name.clone(),
                    enabled: true,
                    reason: None,
                });
                self.included.push(SelectedVolume {
                    volume,
                    claim: *claim,
                });
            }
            Decision::Exclude(reason) => {
                self.statuses.push(VolumeSnapshotStatus {
                    name: volume.name.clone(),
                    enabled: false,
                    reason: Some(reason),
                });
                self.excluded.push(volume.name);
            }
        }
    }
}

/// Resolves claims and storage-class capability, then classifies volumes.
#[derive(Debug, Clone)]
pub struct VolumeSelector {
    ports: Ports,
}

impl VolumeSelector {
    /// Creates a selector over the given ports.
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Selects volumes for `vm`, using `instance` for temporary hotplug volumes.
    pub async fn select(
        &self,
        vm: &VirtualMachine,
        instance: Option<&VmInstance>,
    ) -> Result<VolumeSelection> {
        let key = vm.meta.key();
        let mut selection = VolumeSelection::default();

        for volume in &vm.spec.volumes {
            let kind = self.classify(vm, &key, volume).await?;
            selection.push(volume.clone(), &kind);
        }

        if vm.spec.persistent_state {
            let claim_name = vm.backend_state_claim();
            let state = self.claim_state(&key, &claim_name).await?;
            if matches!(state, ClaimState::Found { .. }) {
                let volume = Volume::new(
                    claim_name.clone(),
                    VolumeSource::PersistentVolumeClaim {
                        claim_name,
                        hotpluggable: false,
                    },
                );
                selection.push(volume, &VolumeKind::BackendState(state));
            }
        }

        if let Some(instance) = instance {
            for volume in &instance.temporary_volumes {
                if vm.spec.volumes.iter().any(|v| v.name == volume.name) {
                    continue;
                }
                selection.push(volume.clone(), &VolumeKind::TemporaryHotplug);
            }
        }

        debug!(
            vm = %key,
            included = ?selection.included_names(),
            excluded = ?selection.excluded,
            "volume selection"
        );
        Ok(selection)
    }

    async fn classify(
        &self,
        vm: &VirtualMachine,
        key: &ObjectKey,
        volume: &Volume,
    ) -> Result<VolumeKind> {
        Ok(match &volume.source {
            VolumeSource::DataVolume { name } => {
                VolumeKind::Claim(self.claim_state(key, name).await?)
            }
            VolumeSource::PersistentVolumeClaim { claim_name, .. } => {
                VolumeKind::Claim(self.claim_state(key, claim_name).await?)
            }
            VolumeSource::MemoryDump { claim_name } => {
                let completed = vm
                    .status
                    .memory_dump
                    .as_ref()
                    .map(|d| d.claim_name == *claim_name && d.phase == MemoryDumpPhase::Completed)
                    .unwrap_or(false);
                VolumeKind::MemoryDump {
                    claim: self.claim_state(key, claim_name).await?,
                    completed,
                }
            }
            other => VolumeKind::Unsupported {
                source_type: other.type_name(),
            },
        })
    }

    async fn claim_state(&self, vm_key: &ObjectKey, claim_name: &str) -> Result<ClaimState> {
        let claim_key = vm_key.sibling(claim_name);
        let Some(claim) = self.ports.claims.get_claim(&claim_key).await? else {
            return Ok(ClaimState::Missing {
                claim_name: claim_name.to_string(),
            });
        };
        let snapshot_capable = match claim.spec.storage_class.as_deref() {
            Some(class) => self
                .ports
                .storage_classes
                .snapshot_class_for(class)
                .await?
                .is_some(),
            None => false,
        };
        Ok(ClaimState::Found {
            claim: Box::new(claim),
            snapshot_capable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryCluster;
    use crate::types::{
        ClaimPhase, ClaimSpec, InstancePhase, MemoryDumpRequest, ObjectMeta,
    };
    use proptest::prelude::*;
    use std::sync::Arc;

    fn claim(name: &str, class: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            meta: ObjectMeta::new("default", name),
            spec: ClaimSpec {
                storage_class: Some(class.to_string()),
                requested_bytes: 1 << 30,
                ..Default::default()
            },
            phase: ClaimPhase::Bound,
        }
    }

    fn setup() -> (Arc<InMemoryCluster>, VolumeSelector) {
        let cluster = Arc::new(InMemoryCluster::new(Arc::new(ManualClock::default())));
        cluster.put_storage_class("csi", Some("csi-snapclass".to_string()));
        cluster.put_storage_class("local", None);
        let selector = VolumeSelector::new(cluster.ports());
        (cluster, selector)
    }

    fn vm_with(volumes: Vec<Volume>) -> VirtualMachine {
        let mut vm = VirtualMachine {
            meta: ObjectMeta::new("default", "vm"),
            ..Default::default()
        };
        vm.spec.volumes = volumes;
        vm
    }

    #[tokio::test]
    async fn test_capable_and_incapable_classes() {
        let (cluster, selector) = setup();
        cluster.put_claim(claim("root", "csi"));
        cluster.put_claim(claim("scratch", "local"));
        let vm = vm_with(vec![
            Volume::new("rootdisk", VolumeSource::DataVolume { name: "root".into() }),
            Volume::new(
                "scratchdisk",
                VolumeSource::PersistentVolumeClaim {
                    claim_name: "scratch".into(),
                    hotpluggable: false,
                },
            ),
            Volume::new(
                "cloudinit",
                VolumeSource::CloudInitNoCloud {
                    user_data: "#cloud-config".into(),
                },
            ),
        ]);

        let sel = selector.select(&vm, None).await.unwrap();
        assert_eq!(sel.included_names(), vec!["rootdisk"]);
        assert_eq!(sel.excluded, vec!["scratchdisk", "cloudinit"]);
        assert_eq!(
            sel.statuses[1].reason.as_deref(),
            Some("No VolumeSnapshotClass: Volume snapshots are not configured for this StorageClass [local] [scratchdisk]")
        );
        assert_eq!(
            sel.statuses[2].reason.as_deref(),
            Some("Snapshot is not supported for this volumeSource type [cloudInitNoCloud]")
        );
        assert!(sel.statuses[0].enabled);
    }

    #[tokio::test]
    async fn test_missing_claim_excluded() {
        let (_cluster, selector) = setup();
        let vm = vm_with(vec![Volume::new(
            "disk",
            VolumeSource::DataVolume { name: "gone".into() },
        )]);
        let sel = selector.select(&vm, None).await.unwrap();
        assert!(sel.included.is_empty());
        assert_eq!(sel.excluded, vec!["disk"]);
    }

    #[tokio::test]
    async fn test_backend_state_appended() {
        let (cluster, selector) = setup();
        cluster.put_claim(claim("root", "csi"));
        cluster.put_claim(claim("persistent-state-for-vm", "csi"));
        let mut vm = vm_with(vec![Volume::new(
            "rootdisk",
            VolumeSource::DataVolume { name: "root".into() },
        )]);
        vm.spec.persistent_state = true;

        let sel = selector.select(&vm, None).await.unwrap();
        assert_eq!(sel.included_names(), vec!["rootdisk", "persistent-state-for-vm"]);
    }

    #[tokio::test]
    async fn test_backend_state_skipped_when_claim_absent() {
        let (cluster, selector) = setup();
        cluster.put_claim(claim("root", "csi"));
        let mut vm = vm_with(vec![Volume::new(
            "rootdisk",
            VolumeSource::DataVolume { name: "root".into() },
        )]);
        vm.spec.persistent_state = true;
        let sel = selector.select(&vm, None).await.unwrap();
        assert_eq!(sel.statuses.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_dump_requires_completion() {
        let (cluster, selector) = setup();
        cluster.put_claim(claim("dump", "csi"));
        let mut vm = vm_with(vec![Volume::new(
            "memdump",
            VolumeSource::MemoryDump {
                claim_name: "dump".into(),
            },
        )]);
        vm.status.memory_dump = Some(MemoryDumpRequest {
            claim_name: "dump".into(),
            phase: MemoryDumpPhase::InProgress,
        });
        let sel = selector.select(&vm, None).await.unwrap();
        assert_eq!(sel.excluded, vec!["memdump"]);

        vm.status.memory_dump = Some(MemoryDumpRequest {
            claim_name: "dump".into(),
            phase: MemoryDumpPhase::Completed,
        });
        let sel = selector.select(&vm, None).await.unwrap();
        assert_eq!(sel.included_names(), vec!["memdump"]);
    }

    #[tokio::test]
    async fn test_temporary_hotplug_excluded() {
        let (cluster, selector) = setup();
        cluster.put_claim(claim("root", "csi"));
        cluster.put_claim(claim("hp", "csi"));
        let vm = vm_with(vec![Volume::new(
            "rootdisk",
            VolumeSource::DataVolume { name: "root".into() },
        )]);
        let instance = VmInstance {
            meta: ObjectMeta::new("default", "vm"),
            phase: InstancePhase::Running,
            temporary_volumes: vec![Volume::new(
                "hotplug",
                VolumeSource::PersistentVolumeClaim {
                    claim_name: "hp".into(),
                    hotpluggable: true,
                },
            )],
            ..Default::default()
        };
        let sel = selector.select(&vm, Some(&instance)).await.unwrap();
        assert_eq!(sel.included_names(), vec!["rootdisk"]);
        assert_eq!(sel.excluded, vec!["hotplug"]);
    }

    #[tokio::test]
    async fn test_unbound_claim_reported() {
        let (cluster, selector) = setup();
        let mut pending = claim("root", "csi");
        pending.phase = ClaimPhase::Pending;
        cluster.put_claim(pending);
        let vm = vm_with(vec![Volume::new(
            "rootdisk",
            VolumeSource::DataVolume { name: "root".into() },
        )]);
        let sel = selector.select(&vm, None).await.unwrap();
        assert_eq!(sel.first_unbound().map(|v| v.volume.name.as_str()), Some("rootdisk"));
    }

    fn arb_state() -> impl Strategy<Value = ClaimState> {
        let found = (any::<bool>(), any::<bool>()).prop_map(|(bound, capable)| {
            let mut c = claim("c", "csi");
            if !bound {
                c.phase = ClaimPhase::Pending;
            }
            ClaimState::Found {
                claim: Box::new(c),
                snapshot_capable: capable,
            }
        });
        prop_oneof![
            Just(ClaimState::Missing {
                claim_name: "c".to_string()
            }),
            found,
        ]
    }

    fn arb_kind() -> impl Strategy<Value = VolumeKind> {
        prop_oneof![
            arb_state().prop_map(VolumeKind::Claim),
            (arb_state(), any::<bool>())
                .prop_map(|(claim, completed)| VolumeKind::MemoryDump { claim, completed }),
            arb_state().prop_map(VolumeKind::BackendState),
            Just(VolumeKind::TemporaryHotplug),
            Just(VolumeKind::Unsupported {
                source_type: "containerDisk"
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_selection_partitions_volumes(kinds in proptest::collection::vec(arb_kind(), 0..12)) {
            let mut sel = VolumeSelection::default();
            for (i, kind) in kinds.iter().enumerate() {
                let volume = Volume::new(
                    format!("vol-{}", i),
                    VolumeSource::ContainerDisk { image: "img".into() },
                );
                sel.push(volume, kind);
            }
            prop_assert_eq!(sel.included.len() + sel.excluded.len(), kinds.len());
            prop_assert_eq!(sel.statuses.len(), kinds.len());
            for status in &sel.statuses {
                let included = sel.included_names().contains(&status.name);
                let excluded = sel.excluded.contains(&status.name);
                prop_assert!(included != excluded);
                prop_assert_eq!(status.enabled, included);
                prop_assert_eq!(status.reason.is_some(), excluded);
            }
            for (i, kind) in kinds.iter().enumerate() {
                let name = format!("vol-{}", i);
                let always_out = matches!(
                    kind,
                    VolumeKind::TemporaryHotplug | VolumeKind::Unsupported { .. }
                );
                if always_out {
                    prop_assert!(sel.excluded.contains(&name));
                }
            }
        }
    }
}
