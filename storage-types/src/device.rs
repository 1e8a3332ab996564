// SPDX-License-Identifier: GPL-3.0-only

//! Block device models
//!
//! Devices form a tagged union: `DeviceCommon` carries the fields every
//! device has, `DeviceExt` the per-kind state. Parent links are `DeviceId`
//! indices into the tree's arena; the tree owns every device, so there are
//! no owning cycles between volume groups and their logical volumes.

use serde::{Deserialize, Serialize};

use crate::format::Format;
use crate::raid::RaidLevel;
use crate::size::Mib;

/// Arena index of a device inside the tree.
pub type DeviceId = u32;

/// Fields shared by every device variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommon {
    /// Kernel-style basename ("sda1", "md0", "vg0-root").
    pub name: String,
    pub sysfs_path: Option<String>,
    pub size: Mib,
    /// Pending size set by a registered resize action.
    pub target_size: Option<Mib>,
    pub parents: Vec<DeviceId>,
    /// Number of children currently in the tree; maintained by the tree.
    pub kids: u32,
    /// True iff the device is currently present on the host.
    pub exists: bool,
    pub format: Option<Format>,
    /// Snapshot of the format found at probe time, before any action
    /// replaced it.
    pub original_format: Option<Format>,
    pub serial: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub bus: Option<String>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    /// Protected devices refuse destructive actions (live image backing
    /// device, user-listed specs).
    pub protected: bool,
}

/// Hardware flavor of a disk. All of these behave as plain partitionable
/// disks; the variant carries the identification the configuration writers
/// and dracut hints need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "bus", rename_all = "snake_case")]
pub enum DiskVariant {
    Plain,
    Iscsi {
        target: String,
        address: String,
        port: u16,
    },
    Fcoe {
        nic: String,
        dcb: bool,
    },
    Dasd {
        bus_id: String,
        opts: Vec<(String, String)>,
    },
    Zfcp {
        hba_id: String,
        wwpn: String,
        fcp_lun: String,
    },
    Optical,
    /// A firmware RAID set surfaced as one disk by dmraid.
    BiosRaid {
        raid_set: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskExt {
    pub variant: DiskVariant,
    /// True when probe could not read a disklabel and policy forbids
    /// reinitialization; the disk is carried but refuses partitioning.
    pub unusable: bool,
}

impl Default for DiskExt {
    fn default() -> Self {
        DiskExt {
            variant: DiskVariant::Plain,
            unusable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartType {
    Primary,
    Extended,
    Logical,
    /// Whole-disk protective partition (GPT PMBR, DASD).
    Protected,
}

/// Authoritative on-label geometry, in 512-byte sectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartGeometry {
    pub start: u64,
    pub length: u64,
}

impl PartGeometry {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn size(&self) -> Mib {
        Mib::from_sectors(self.length)
    }
}

/// Allocation request attached to a not-yet-created partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionRequestBlock {
    /// Candidate disks by name; empty means any eligible disk.
    pub disks: Vec<String>,
    pub base_size: Mib,
    pub min_size: Option<Mib>,
    pub max_size: Option<Mib>,
    pub grow: bool,
    pub primary_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionExt {
    pub part_type: PartType,
    pub bootable: bool,
    /// Partition number on its disk, once allocated.
    pub number: Option<u32>,
    pub geometry: Option<PartGeometry>,
    pub weight: i32,
    /// Present only on partitions that do not exist yet.
    pub req: Option<PartitionRequestBlock>,
}

impl Default for PartitionExt {
    fn default() -> Self {
        PartitionExt {
            part_type: PartType::Primary,
            bootable: false,
            number: None,
            geometry: None,
            weight: 0,
            req: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdKind {
    /// Kernel-native metadata array.
    Array,
    /// External-metadata container (IMSM/DDF).
    Container,
    /// Data array living inside a container; the only partitionable MD.
    BiosRaidArray,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdExt {
    pub kind: MdKind,
    pub level: RaidLevel,
    /// Active members, not counting spares.
    pub member_count: u32,
    /// Members plus spares.
    pub total_devices: u32,
    pub bitmap: bool,
    pub uuid: Option<String>,
    pub chunk_size_kib: u32,
    pub metadata_version: Option<String>,
    pub degraded: bool,
}

impl Default for MdExt {
    fn default() -> Self {
        MdExt {
            kind: MdKind::Array,
            level: RaidLevel::Raid1,
            member_count: 0,
            total_devices: 0,
            bitmap: false,
            uuid: None,
            chunk_size_kib: 512,
            metadata_version: None,
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultipathExt {
    pub wwid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DmRaidExt {
    pub raid_set: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VgExt {
    pub uuid: Option<String>,
    pub pe_size: Mib,
    pub pe_count: u64,
    pub pe_free: u64,
    /// PV count the VG metadata claims; the VG is complete iff the parent
    /// list is this long.
    pub pv_count: u32,
    /// Logical volumes carved out of this group, in creation order.
    pub lvs: Vec<DeviceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LvRequestBlock {
    pub grow: bool,
    pub max_size: Option<Mib>,
    pub percent: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LvExt {
    pub uuid: Option<String>,
    pub stripes: u32,
    pub log_size: Mib,
    /// Space consumed in the VG by snapshots of this LV.
    pub snapshot_space: Mib,
    pub req: Option<LvRequestBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LuksExt {
    /// Mapping name, always `luks-<uuid of the parent's LUKS format>`.
    pub map_name: String,
}

/// Per-kind device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceExt {
    Disk(DiskExt),
    Partition(PartitionExt),
    MdArray(MdExt),
    DmRaidArray(DmRaidExt),
    Multipath(MultipathExt),
    LvmVolumeGroup(VgExt),
    LvmLogicalVolume(LvExt),
    Luks(LuksExt),
    /// A regular file on a mounted filesystem (swap files, bind sources).
    File,
    Directory,
    Nfs,
    NoDevice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub common: DeviceCommon,
    pub kind: DeviceExt,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, kind: DeviceExt) -> Self {
        Device {
            id,
            common: DeviceCommon {
                name: name.into(),
                ..DeviceCommon::default()
            },
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.common.name
    }

    /// Canonical /dev path. Device-mapper backed kinds live under
    /// /dev/mapper; files and NFS keep their name verbatim.
    pub fn path(&self) -> String {
        match &self.kind {
            DeviceExt::Luks(ext) => format!("/dev/mapper/{}", ext.map_name),
            DeviceExt::Multipath(_) | DeviceExt::DmRaidArray(_) => {
                format!("/dev/mapper/{}", self.common.name)
            }
            DeviceExt::LvmLogicalVolume(_) => format!("/dev/mapper/{}", self.common.name),
            DeviceExt::LvmVolumeGroup(_) => format!("/dev/{}", self.common.name),
            DeviceExt::File | DeviceExt::Directory | DeviceExt::Nfs | DeviceExt::NoDevice => {
                self.common.name.clone()
            }
            _ => format!("/dev/{}", self.common.name),
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(
            self.kind,
            DeviceExt::Disk(_) | DeviceExt::Multipath(_) | DeviceExt::DmRaidArray(_)
        ) || matches!(
            &self.kind,
            DeviceExt::MdArray(MdExt { kind: MdKind::BiosRaidArray, .. })
        )
    }

    /// Whether a disklabel may be written on this device.
    pub fn is_partitionable(&self) -> bool {
        match &self.kind {
            DeviceExt::Disk(ext) => !ext.unusable && !matches!(ext.variant, DiskVariant::Optical),
            DeviceExt::Multipath(_) | DeviceExt::DmRaidArray(_) => true,
            DeviceExt::MdArray(ext) => ext.kind == MdKind::BiosRaidArray,
            _ => false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.common.kids == 0
    }

    /// Whether the device node is present and usable right now. Planned
    /// devices report false until their create action has run.
    pub fn status(&self) -> bool {
        self.common.exists
    }

    pub fn size(&self) -> Mib {
        self.common.target_size.unwrap_or(self.common.size)
    }

    pub fn format(&self) -> Option<&Format> {
        self.common.format.as_ref()
    }

    pub fn as_partition(&self) -> Option<&PartitionExt> {
        match &self.kind {
            DeviceExt::Partition(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn as_partition_mut(&mut self) -> Option<&mut PartitionExt> {
        match &mut self.kind {
            DeviceExt::Partition(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn as_vg(&self) -> Option<&VgExt> {
        match &self.kind {
            DeviceExt::LvmVolumeGroup(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn as_vg_mut(&mut self) -> Option<&mut VgExt> {
        match &mut self.kind {
            DeviceExt::LvmVolumeGroup(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn as_md(&self) -> Option<&MdExt> {
        match &self.kind {
            DeviceExt::MdArray(ext) => Some(ext),
            _ => None,
        }
    }

    /// Composite devices need activation before use and teardown before
    /// their members can be touched.
    pub fn is_composite(&self) -> bool {
        matches!(
            self.kind,
            DeviceExt::MdArray(_)
                | DeviceExt::DmRaidArray(_)
                | DeviceExt::Multipath(_)
                | DeviceExt::LvmVolumeGroup(_)
                | DeviceExt::LvmLogicalVolume(_)
                | DeviceExt::Luks(_)
        )
    }
}

/// VG bookkeeping helpers used by both the tree and the action layer.
impl VgExt {
    pub fn size(&self) -> Mib {
        Mib(self.pe_count * self.pe_size.0)
    }

    pub fn free_space(&self) -> Mib {
        Mib(self.pe_free * self.pe_size.0)
    }

    /// Extent-aligned footprint of an LV of `size` in this group.
    pub fn align_up(&self, size: Mib) -> Mib {
        size.align_up(self.pe_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(id: DeviceId, name: &str) -> Device {
        let mut device = Device::new(id, name, DeviceExt::Disk(DiskExt::default()));
        device.common.exists = true;
        device
    }

    #[test]
    fn disk_paths_and_predicates() {
        let sda = disk(0, "sda");
        assert_eq!(sda.path(), "/dev/sda");
        assert!(sda.is_disk());
        assert!(sda.is_partitionable());
        assert!(sda.is_leaf());
    }

    #[test]
    fn optical_disks_are_not_partitionable() {
        let mut sr0 = disk(1, "sr0");
        if let DeviceExt::Disk(ext) = &mut sr0.kind {
            ext.variant = DiskVariant::Optical;
        }
        assert!(sr0.is_disk());
        assert!(!sr0.is_partitionable());
    }

    #[test]
    fn only_biosraid_md_is_partitionable() {
        let plain = Device::new(2, "md0", DeviceExt::MdArray(MdExt::default()));
        assert!(!plain.is_partitionable());
        assert!(!plain.is_disk());

        let imsm = Device::new(
            3,
            "md126",
            DeviceExt::MdArray(MdExt {
                kind: MdKind::BiosRaidArray,
                ..MdExt::default()
            }),
        );
        assert!(imsm.is_partitionable());
        assert!(imsm.is_disk());
    }

    #[test]
    fn mapper_kinds_resolve_under_dev_mapper() {
        let luks = Device::new(
            4,
            "luks-00-11",
            DeviceExt::Luks(LuksExt {
                map_name: "luks-00-11".to_string(),
            }),
        );
        assert_eq!(luks.path(), "/dev/mapper/luks-00-11");

        let lv = Device::new(5, "vg0-root", DeviceExt::LvmLogicalVolume(LvExt::default()));
        assert_eq!(lv.path(), "/dev/mapper/vg0-root");
    }

    #[test]
    fn vg_extent_accounting() {
        let vg = VgExt {
            pe_size: Mib(4),
            pe_count: 1000,
            pe_free: 250,
            ..VgExt::default()
        };
        assert_eq!(vg.size(), Mib(4000));
        assert_eq!(vg.free_space(), Mib(1000));
        assert_eq!(vg.align_up(Mib(10)), Mib(12));
    }

    #[test]
    fn device_serialization_round_trips() {
        let mut sda1 = Device::new(8, "sda1", DeviceExt::Partition(PartitionExt::default()));
        sda1.common.size = Mib(500);
        sda1.common.parents = vec![0];
        let json = serde_json::to_string(&sda1).unwrap();
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(sda1, back);
    }

    #[test]
    fn target_size_overrides_current_size() {
        let mut sda = disk(6, "sda");
        sda.common.size = Mib(10_000);
        assert_eq!(sda.size(), Mib(10_000));
        sda.common.target_size = Some(Mib(8_000));
        assert_eq!(sda.size(), Mib(8_000));
    }
}
