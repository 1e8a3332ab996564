// SPDX-License-Identifier: GPL-3.0-only

//! Tree population from probe data
//!
//! `ProbeSnapshot::gather` reads the live system (udev db, sysfs, lvm and
//! mdadm reports) into a plain value; `populate` turns a snapshot into a
//! device tree. Keeping the two apart means the whole classification
//! pipeline runs in tests against hand-built snapshots, and the gather
//! step never mutates on-disk state.
//!
//! Per-device failures are never fatal: the device is logged and skipped,
//! and anything stacked on it is skipped with it.

use std::collections::BTreeMap;
use std::path::Path;

use storage_types::{
    get_format, Device, DeviceExt, DeviceId, DiskExt, DiskVariant, FormatArgs, FormatExt, LuksExt,
    LvExt, MdExt, MdKind, Mib, MultipathExt, PartGeometry, PartType, PartitionExt, RaidLevel,
    VgExt,
};

use storage_sys::lvm::{self, LvReport, PvReport, VgReport};
use storage_sys::mdraid::{self, MdScanEntry};
use storage_sys::multipath::identify_multipaths;
use storage_sys::udev::{self, UdevInfo};
use storage_sys::{disklabel, sysfs, Runner};

use crate::tree::DeviceTree;
use crate::Result;

/// Partition placement read from the disklabel.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionInfo {
    pub disk: String,
    pub number: u32,
    pub part_type: PartType,
    pub start: u64,
    pub length: u64,
    pub bootable: bool,
}

/// One block device as observed at probe time.
#[derive(Debug, Clone, Default)]
pub struct ProbedDevice {
    pub info: UdevInfo,
    pub size: Mib,
    pub sysfs_path: String,
    pub slaves: Vec<String>,
    pub removable: bool,
    pub partition: Option<PartitionInfo>,
    /// Disklabel type name when one was read off the device.
    pub disklabel: Option<String>,
    /// A label read was attempted and failed (garbage, not just absent).
    pub label_unreadable: bool,
}

/// Everything populate consumes, gathered in one pass.
#[derive(Debug, Clone, Default)]
pub struct ProbeSnapshot {
    pub devices: Vec<ProbedDevice>,
    pub vgs: Vec<VgReport>,
    pub lvs: Vec<LvReport>,
    pub pvs: Vec<PvReport>,
    pub md_arrays: Vec<MdScanEntry>,
}

impl ProbeSnapshot {
    pub fn device(&self, name: &str) -> Option<&ProbedDevice> {
        self.devices.iter().find(|d| d.info.name == name)
    }

    /// Read the live system. Requires root for the disklabel reads; lvm
    /// and mdadm report failures degrade to empty report sets.
    pub fn gather(runner: &dyn Runner, lvm_ignored: &[String]) -> Result<ProbeSnapshot> {
        let mut snapshot = ProbeSnapshot::default();

        for info in udev::enumerate_block_devices()? {
            let sysfs_path = sysfs::sysfs_path(&info.name);
            let size = Mib::from_sectors(sysfs::size_sectors(&sysfs_path).unwrap_or(0));
            let slaves = sysfs::slaves(&sysfs_path);
            let removable = sysfs::is_removable(&sysfs_path);

            let partition = if info.is_partition() {
                sysfs::partition_disk(&sysfs_path).map(|disk| PartitionInfo {
                    disk,
                    number: sysfs::partition_number(&sysfs_path).unwrap_or(0),
                    part_type: PartType::Primary,
                    start: 0,
                    length: 0,
                    bootable: false,
                })
            } else {
                None
            };

            let mut probed = ProbedDevice {
                info,
                size,
                sysfs_path: sysfs_path.display().to_string(),
                slaves,
                removable,
                partition,
                disklabel: None,
                label_unreadable: false,
            };

            if probed.partition.is_none() && !probed.info.is_cdrom() {
                let path = format!("/dev/{}", probed.info.name);
                match disklabel::read_label(Path::new(&path)) {
                    Ok(label) => {
                        probed.disklabel = Some(label.label_type.as_str().to_string());
                        // Fold the authoritative geometry into the
                        // partition entries gathered above.
                        for part in &label.partitions {
                            snapshot.apply_geometry(&probed.info.name, part);
                        }
                    }
                    Err(storage_sys::SysError::InvalidDiskLabel(_)) => {
                        probed.label_unreadable = true;
                    }
                    Err(_) => {}
                }
            }
            snapshot.devices.push(probed);
        }

        let filter = lvm::filter_config(lvm_ignored);
        snapshot.vgs = lvm::vgs(runner, &filter).unwrap_or_default();
        snapshot.lvs = lvm::lvs(runner, &filter).unwrap_or_default();
        snapshot.pvs = lvm::pvs(runner, &filter).unwrap_or_default();
        snapshot.md_arrays = mdraid::examine_scan(runner).unwrap_or_default();

        Ok(snapshot)
    }

    fn apply_geometry(&mut self, disk: &str, part: &disklabel::LabelPartition) {
        for device in &mut self.devices {
            if let Some(info) = &mut device.partition {
                if info.disk == disk && info.number == part.number {
                    info.part_type = part.part_type;
                    info.start = part.start;
                    info.length = part.length;
                    info.bootable = part.bootable;
                }
            }
        }
    }
}

/// Populate `tree` from a snapshot, running the §4.1 pipeline. `runner`
/// is only used for the final leaf teardown and udev settling.
pub fn populate(tree: &mut DeviceTree, snapshot: &ProbeSnapshot, runner: &dyn Runner) -> Result<()> {
    let mut builder = Builder {
        tree,
        snapshot,
        ids: BTreeMap::new(),
        skipped: Vec::new(),
    };

    builder.resolve_protected();
    builder.collect_ignored();

    // Multipath tripartition runs on whole-disk entries only; members get
    // their member format before anything stacks on them.
    let infos: Vec<UdevInfo> = snapshot
        .devices
        .iter()
        .filter(|d| !builder.is_ignored(&d.info.name))
        .map(|d| d.info.clone())
        .collect();
    let topology = identify_multipaths(&infos);

    for group in &topology.groups {
        builder.build_multipath_group(group);
    }
    for single in &topology.singles {
        builder.ensure_device(&single.name);
    }
    for part in &topology.partitions {
        builder.ensure_device(&part.name);
    }

    builder.attach_lvm_chains();
    builder.attach_md_arrays();
    builder.handle_incomplete_vgs();

    if !builder.skipped.is_empty() {
        tracing::warn!(
            devices = ?builder.skipped,
            "some devices could not be modelled and were skipped"
        );
    }

    teardown_leaves(tree, runner);
    udev::settle(runner).ok();
    tree.populated = true;
    Ok(())
}

struct Builder<'a> {
    tree: &'a mut DeviceTree,
    snapshot: &'a ProbeSnapshot,
    ids: BTreeMap<String, DeviceId>,
    skipped: Vec<String>,
}

impl<'a> Builder<'a> {
    fn resolve_protected(&mut self) {
        let specs = self.tree.config.protected_specs.clone();
        for spec in specs {
            let name = self.snapshot.devices.iter().find_map(|d| {
                let info = &d.info;
                let matched = if let Some(uuid) = spec.strip_prefix("UUID=") {
                    info.fs_uuid.as_deref() == Some(uuid)
                } else if let Some(label) = spec.strip_prefix("LABEL=") {
                    info.fs_label.as_deref() == Some(label)
                } else {
                    spec == format!("/dev/{}", info.name)
                        || info.symlinks.iter().any(|s| *s == spec)
                };
                matched.then(|| info.name.clone())
            });
            match name {
                Some(name) => self.tree.protected_names.push(name),
                None => tracing::warn!(spec, "protected device spec matched nothing"),
            }
        }
    }

    /// Ignored disks never enter the tree, and their paths go on the LVM
    /// filter so VG scans cannot resurrect them.
    fn collect_ignored(&mut self) {
        for device in &self.snapshot.devices {
            if device.partition.is_none() && self.tree.config.disk_is_ignored(&device.info.name) {
                self.tree
                    .lvm_ignored
                    .push(format!("/dev/{}", device.info.name));
            }
        }
    }

    fn is_ignored(&self, name: &str) -> bool {
        let whole_disk = match self.snapshot.device(name) {
            Some(d) => d.partition.as_ref().map(|p| p.disk.clone()),
            None => None,
        };
        let check = whole_disk.as_deref().unwrap_or(name);
        self.tree.config.disk_is_ignored(check)
    }

    fn build_multipath_group(&mut self, group: &[UdevInfo]) {
        let mut member_ids = Vec::new();
        for info in group {
            if let Some(id) = self.ensure_device(&info.name) {
                if let Some(device) = self.tree.get_mut(id) {
                    let mut format = get_format(
                        "multipath_member",
                        FormatArgs {
                            device: Some(device.path()),
                            exists: true,
                            ..FormatArgs::default()
                        },
                    );
                    format.common.exists = true;
                    device.common.format = Some(format.clone());
                    device.common.original_format = Some(format);
                }
                member_ids.push(id);
            }
        }
        if member_ids.len() < 2 {
            return;
        }

        let wwid = group[0]
            .wwn
            .clone()
            .or_else(|| group[0].serial_short.clone())
            .unwrap_or_default();
        let name = format!("mpath{}", (b'a' + (self.count_multipaths() as u8)) as char);
        let id = self.tree.next_device_id();
        let mut device = Device::new(id, name.clone(), DeviceExt::Multipath(MultipathExt { wwid }));
        device.common.exists = true;
        device.common.size = group
            .iter()
            .filter_map(|info| self.snapshot.device(&info.name))
            .map(|d| d.size)
            .max()
            .unwrap_or(Mib(0));
        device.common.parents = member_ids;
        device.common.serial = group[0].serial_short.clone();
        self.ids.insert(name, self.tree.add_device(device));
    }

    fn count_multipaths(&self) -> usize {
        self.tree
            .devices()
            .filter(|d| matches!(d.kind, DeviceExt::Multipath(_)))
            .count()
    }

    /// Build the device for `name`, parents first, and return its id.
    /// Returns None when the device (or one of its parents) cannot be
    /// modelled; the caller's dependents are skipped with it.
    fn ensure_device(&mut self, name: &str) -> Option<DeviceId> {
        if let Some(id) = self.ids.get(name) {
            return Some(*id);
        }
        if self.is_ignored(name) {
            return None;
        }
        let probed = match self.snapshot.device(name) {
            Some(probed) => probed.clone(),
            None => {
                self.skipped.push(name.to_string());
                return None;
            }
        };

        // Parents first; a missing parent poisons this device too.
        let mut parent_ids = Vec::new();
        let parent_names: Vec<String> = match &probed.partition {
            Some(part) => vec![part.disk.clone()],
            None => probed.slaves.clone(),
        };
        for parent in &parent_names {
            match self.ensure_device(parent) {
                Some(id) => parent_ids.push(id),
                None => {
                    tracing::warn!(device = name, parent, "skipping device with unusable parent");
                    self.skipped.push(name.to_string());
                    return None;
                }
            }
        }

        let kind = self.classify(&probed)?;
        let id = self.tree.next_device_id();
        let mut device = Device::new(id, name, kind);
        device.common.exists = true;
        device.common.size = probed.size;
        device.common.sysfs_path = Some(probed.sysfs_path.clone());
        device.common.parents = parent_ids;
        device.common.serial = probed.info.serial_short.clone();
        device.common.vendor = probed.info.vendor.clone();
        device.common.model = probed.info.model.clone();
        device.common.bus = probed.info.bus.clone();
        device.common.major = Some(probed.info.major);
        device.common.minor = Some(probed.info.minor);
        device.common.protected = self.tree.protected_names.iter().any(|p| p == name);

        let id = self.tree.add_device(device);
        self.ids.insert(name.to_string(), id);
        self.attach_format(id, &probed);
        Some(id)
    }

    /// Classification priority per the probe pipeline: dm maps first
    /// (multipath, crypt, lvm, dmraid), then md, cdrom, disks, partitions.
    fn classify(&mut self, probed: &ProbedDevice) -> Option<DeviceExt> {
        let info = &probed.info;

        if info.is_dm() {
            if info.is_multipath_map() {
                return Some(DeviceExt::Multipath(MultipathExt {
                    wwid: info
                        .dm_uuid
                        .as_deref()
                        .and_then(|u| u.strip_prefix("mpath-"))
                        .unwrap_or_default()
                        .to_string(),
                }));
            }
            if info.is_crypt_map() {
                return Some(DeviceExt::Luks(LuksExt {
                    map_name: info.dm_name.clone().unwrap_or_else(|| info.name.clone()),
                }));
            }
            if info.is_lvm_map() {
                return Some(DeviceExt::LvmLogicalVolume(LvExt::default()));
            }
            if info
                .dm_uuid
                .as_deref()
                .map(|u| u.starts_with("DMRAID-"))
                .unwrap_or(false)
            {
                return Some(DeviceExt::DmRaidArray(storage_types::DmRaidExt {
                    raid_set: info.dm_name.clone().unwrap_or_default(),
                }));
            }
            tracing::debug!(name = info.name, "unrecognized dm map skipped");
            self.skipped.push(info.name.clone());
            return None;
        }

        if info.is_md() || info.name.starts_with("md") {
            let kind = if info.md_container.is_some() {
                MdKind::BiosRaidArray
            } else if info.md_level.as_deref() == Some("container") {
                MdKind::Container
            } else {
                MdKind::Array
            };
            let level = info
                .md_level
                .as_deref()
                .and_then(|l| l.parse::<RaidLevel>().ok())
                .unwrap_or(RaidLevel::Raid1);
            return Some(DeviceExt::MdArray(MdExt {
                kind,
                level,
                member_count: info.md_devices.unwrap_or(0),
                total_devices: info.md_devices.unwrap_or(0),
                uuid: info.md_uuid.clone(),
                metadata_version: info.md_metadata.clone(),
                ..MdExt::default()
            }));
        }

        if info.is_cdrom() {
            return Some(DeviceExt::Disk(DiskExt {
                variant: DiskVariant::Optical,
                unusable: false,
            }));
        }

        if let Some(part) = &probed.partition {
            return Some(DeviceExt::Partition(PartitionExt {
                part_type: part.part_type,
                bootable: part.bootable,
                number: Some(part.number),
                geometry: Some(PartGeometry {
                    start: part.start,
                    length: part.length,
                }),
                weight: 0,
                req: None,
            }));
        }

        let variant = if probed.info.name.starts_with("dasd") {
            DiskVariant::Dasd {
                bus_id: String::new(),
                opts: Vec::new(),
            }
        } else {
            DiskVariant::Plain
        };
        let unusable = probed.label_unreadable
            && !self.tree.config.zero_mbr
            && !self
                .tree
                .config
                .reinitialize_disks
                .iter()
                .any(|d| *d == probed.info.name);
        if unusable {
            tracing::warn!(
                name = probed.info.name,
                "unreadable disklabel and reinitialization not allowed; disk carried as unusable"
            );
        }
        Some(DeviceExt::Disk(DiskExt { variant, unusable }))
    }

    fn attach_format(&mut self, id: DeviceId, probed: &ProbedDevice) {
        let path = match self.tree.get(id) {
            Some(d) => d.path(),
            None => return,
        };

        // Disklabels come from the label scan, not ID_FS_TYPE.
        if let Some(label_type) = &probed.disklabel {
            if let Some(device) = self.tree.get_mut(id) {
                if device.is_partitionable() {
                    let mut format = get_format(
                        label_type,
                        FormatArgs {
                            device: Some(path),
                            exists: true,
                            ..FormatArgs::default()
                        },
                    );
                    format.common.exists = true;
                    device.common.format = Some(format.clone());
                    device.common.original_format = Some(format);
                    return;
                }
            }
        }

        let Some(type_name) = probed.info.fs_type.clone() else {
            return;
        };
        let mut format = get_format(
            &type_name,
            FormatArgs {
                device: Some(path.clone()),
                uuid: probed.info.fs_uuid.clone(),
                label: probed.info.fs_label.clone(),
                exists: true,
                md_uuid: probed.info.md_uuid.clone(),
                vg_name: probed.info.lvm_vg_name.clone(),
                vg_uuid: probed.info.lvm_vg_uuid.clone(),
                ..FormatArgs::default()
            },
        );
        format.common.exists = true;

        let is_luks = format.is_luks();
        if let Some(device) = self.tree.get_mut(id) {
            // Keep the multipath member format a group pass installed.
            if device
                .format()
                .map(|f| matches!(f.kind, FormatExt::MultipathMember))
                .unwrap_or(false)
            {
                return;
            }
            device.common.format = Some(format.clone());
            device.common.original_format = Some(format);
        }

        if is_luks {
            self.attach_luks_child(id, probed, &path);
        }
    }

    /// Child LUKS device: the open dm map when one exists, otherwise a
    /// planned mapping if we hold a passphrase for the device.
    fn attach_luks_child(&mut self, id: DeviceId, probed: &ProbedDevice, path: &str) {
        let map_exists = self.snapshot.devices.iter().any(|d| {
            d.info.is_crypt_map() && d.slaves.iter().any(|s| *s == probed.info.name)
        });
        if map_exists {
            // Built through the normal dm pass when its name comes up.
            return;
        }
        if self.tree.config.passphrase_for(path).is_none() {
            tracing::debug!(device = path, "LUKS device with no passphrase; leaving locked");
            return;
        }
        let uuid = probed.info.fs_uuid.clone().unwrap_or_default();
        let map_name = format!("luks-{uuid}");
        let child_id = self.tree.next_device_id();
        let mut child = Device::new(
            child_id,
            map_name.clone(),
            DeviceExt::Luks(LuksExt { map_name }),
        );
        child.common.exists = false;
        child.common.size = probed.size;
        child.common.parents = vec![id];
        self.ids.insert(child.name().to_string(), child_id);
        self.tree.add_device(child);
    }

    /// Build VG and LV devices from the lvm reports, hanging VGs off the
    /// PV-formatted devices already in the tree.
    fn attach_lvm_chains(&mut self) {
        for vg_report in &self.snapshot.vgs {
            let pv_ids: Vec<DeviceId> = self
                .snapshot
                .pvs
                .iter()
                .filter(|pv| pv.vg_name.as_deref() == Some(vg_report.name.as_str()))
                .filter_map(|pv| self.tree.get_by_path(&pv.pv_name).map(|d| d.id))
                .collect();
            if pv_ids.is_empty() {
                tracing::warn!(vg = vg_report.name, "volume group with no visible PVs skipped");
                continue;
            }

            let vg_id = match self.ids.get(&vg_report.name) {
                Some(id) => *id,
                None => {
                    let id = self.tree.next_device_id();
                    let mut vg = Device::new(
                        id,
                        vg_report.name.clone(),
                        DeviceExt::LvmVolumeGroup(VgExt {
                            uuid: Some(vg_report.uuid.clone()),
                            pe_size: vg_report.pe_size,
                            pe_count: vg_report.pe_count,
                            pe_free: vg_report.pe_free,
                            pv_count: vg_report.pv_count,
                            lvs: Vec::new(),
                        }),
                    );
                    vg.common.exists = true;
                    vg.common.size = Mib(vg_report.pe_count * vg_report.pe_size.0);
                    vg.common.parents = pv_ids;
                    let id = self.tree.add_device(vg);
                    self.ids.insert(vg_report.name.clone(), id);
                    id
                }
            };

            let lv_reports: Vec<LvReport> = self
                .snapshot
                .lvs
                .iter()
                .filter(|lv| lv.vg_name == vg_report.name)
                .cloned()
                .collect();
            for lv in &lv_reports {
                if lv.is_mirror_image() || lv.is_mirror_log() {
                    continue;
                }
                if lv.is_snapshot() {
                    if let Some(origin) = &lv.origin {
                        let origin_name = format!("{}-{}", vg_report.name, origin);
                        if let Some(origin_id) = self.ids.get(&origin_name).copied() {
                            if let Some(DeviceExt::LvmLogicalVolume(ext)) =
                                self.tree.get_mut(origin_id).map(|d| &mut d.kind)
                            {
                                ext.snapshot_space = ext.snapshot_space + lv.size;
                            }
                        }
                    }
                    continue;
                }
                self.attach_lv(vg_id, &vg_report.name, lv);
            }
        }
    }

    fn attach_lv(&mut self, vg_id: DeviceId, vg_name: &str, lv: &LvReport) {
        let name = format!("{}-{}", vg_name, lv.lv_name);
        if self.ids.contains_key(&name) {
            return;
        }
        let id = self.tree.next_device_id();
        let mut device = Device::new(
            id,
            name.clone(),
            DeviceExt::LvmLogicalVolume(LvExt {
                uuid: Some(lv.uuid.clone()),
                stripes: 1,
                ..LvExt::default()
            }),
        );
        device.common.exists = true;
        device.common.size = lv.size;
        device.common.parents = vec![vg_id];

        // Carry over the filesystem observed on the active map, if any.
        if let Some(probed) = self.snapshot.device(&name).cloned() {
            device.common.sysfs_path = Some(probed.sysfs_path.clone());
            let id = self.tree.add_device(device);
            self.ids.insert(name, id);
            if let Some(vg) = self.tree.get_mut(vg_id).and_then(|d| d.as_vg_mut()) {
                vg.lvs.push(id);
            }
            self.attach_format(id, &probed);
            return;
        }

        let id = self.tree.add_device(device);
        self.ids.insert(name, id);
        if let Some(vg) = self.tree.get_mut(vg_id).and_then(|d| d.as_vg_mut()) {
            vg.lvs.push(id);
        }
    }

    /// Join md-member formats to their arrays; create array devices that
    /// the enumeration did not surface (not yet assembled).
    fn attach_md_arrays(&mut self) {
        let members: Vec<(DeviceId, String)> = self
            .tree
            .devices()
            .filter_map(|d| {
                let uuid = match d.format().map(|f| &f.kind) {
                    Some(FormatExt::MdMember(ext)) => ext.md_uuid.clone()?,
                    _ => return None,
                };
                Some((d.id, uuid))
            })
            .collect();

        for (member_id, uuid) in members {
            let array_id = self
                .tree
                .devices()
                .find(|d| d.as_md().and_then(|m| m.uuid.as_deref()) == Some(uuid.as_str()))
                .map(|d| d.id);
            match array_id {
                Some(array_id) => {
                    if let Some(array) = self.tree.get_mut(array_id) {
                        if !array.common.parents.contains(&member_id) {
                            array.common.parents.push(member_id);
                        }
                    }
                    if let Some(member) = self.tree.get_mut(member_id) {
                        member.common.kids += 1;
                    }
                }
                None => {
                    let scan = self
                        .snapshot
                        .md_arrays
                        .iter()
                        .find(|entry| entry.uuid.as_deref() == Some(uuid.as_str()));
                    let name = scan
                        .map(|e| {
                            e.device
                                .trim_start_matches("/dev/")
                                .replace('/', "_")
                        })
                        .unwrap_or_else(|| format!("md_{uuid}"));
                    let level = scan
                        .and_then(|e| e.level.as_deref())
                        .and_then(|l| l.parse::<RaidLevel>().ok())
                        .unwrap_or(RaidLevel::Raid1);
                    let id = self.tree.next_device_id();
                    let mut array = Device::new(
                        id,
                        name.clone(),
                        DeviceExt::MdArray(MdExt {
                            level,
                            uuid: Some(uuid.clone()),
                            member_count: scan.and_then(|e| e.num_devices).unwrap_or(0),
                            total_devices: scan.and_then(|e| e.num_devices).unwrap_or(0),
                            metadata_version: scan.and_then(|e| e.metadata.clone()),
                            ..MdExt::default()
                        }),
                    );
                    array.common.exists = true;
                    array.common.parents = vec![member_id];
                    let id = self.tree.add_device(array);
                    self.ids.insert(name, id);
                }
            }
        }
    }

    /// A VG whose parent list is shorter than its claimed PV count is
    /// inconsistent. With `zero_mbr` the group and its LVs are dropped and
    /// the surviving PVs reset to unformatted; otherwise the group is kept
    /// (incomplete, refusing modification) and a warning surfaced.
    fn handle_incomplete_vgs(&mut self) {
        let incomplete: Vec<DeviceId> = self
            .tree
            .devices()
            .filter(|d| {
                d.as_vg()
                    .map(|vg| (d.common.parents.len() as u32) < vg.pv_count)
                    .unwrap_or(false)
            })
            .map(|d| d.id)
            .collect();

        for vg_id in incomplete {
            let name = self
                .tree
                .get(vg_id)
                .map(|d| d.name().to_string())
                .unwrap_or_default();
            if !self.tree.config.zero_mbr {
                tracing::warn!(vg = name, "incomplete volume group left untouched");
                continue;
            }
            tracing::warn!(vg = name, "dropping incomplete volume group");

            let lvs = self
                .tree
                .get(vg_id)
                .and_then(|d| d.as_vg())
                .map(|vg| vg.lvs.clone())
                .unwrap_or_default();
            for lv in lvs {
                self.tree.remove_device(lv).ok();
            }
            let parents = self
                .tree
                .get(vg_id)
                .map(|d| d.common.parents.clone())
                .unwrap_or_default();
            self.tree.remove_device(vg_id).ok();
            for pv in parents {
                if let Some(device) = self.tree.get_mut(pv) {
                    device.common.format = Some(storage_types::Format::unformatted());
                    let path = device.path();
                    self.tree.lvm_ignored.push(path);
                }
            }
        }
    }
}

/// Tear every active composite leaf down so execution starts quiescent.
/// Children go before parents; repeated passes handle the stacking.
fn teardown_leaves(tree: &DeviceTree, runner: &dyn Runner) {
    let filter = lvm::filter_config(&tree.lvm_ignored);
    let mut by_depth: Vec<&Device> = tree.devices().collect();
    by_depth.sort_by_key(|d| std::cmp::Reverse(tree.ancestors(d.id).len()));

    for device in by_depth {
        if !device.common.exists {
            continue;
        }
        let result = match &device.kind {
            DeviceExt::LvmLogicalVolume(_) => {
                let (vg, lv) = match device.name().split_once('-') {
                    Some(pair) => pair,
                    None => continue,
                };
                lvm::lv_deactivate(runner, &filter, vg, lv)
            }
            DeviceExt::LvmVolumeGroup(_) => lvm::vg_deactivate(runner, &filter, device.name()),
            DeviceExt::MdArray(ext) if ext.kind != MdKind::Container => {
                mdraid::deactivate(runner, &device.path())
            }
            DeviceExt::Luks(ext) => storage_sys::crypto::luks_close(runner, &ext.map_name),
            _ => continue,
        };
        if let Err(err) = result {
            tracing::debug!(device = device.name(), %err, "teardown skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use storage_sys::ScriptedRunner;

    fn disk(name: &str, serial: Option<&str>, size: Mib) -> ProbedDevice {
        ProbedDevice {
            info: UdevInfo {
                name: name.to_string(),
                serial_short: serial.map(str::to_string),
                ..UdevInfo::default()
            },
            size,
            sysfs_path: format!("/sys/class/block/{name}"),
            ..ProbedDevice::default()
        }
    }

    fn partition(name: &str, disk: &str, number: u32, fs: Option<&str>) -> ProbedDevice {
        ProbedDevice {
            info: UdevInfo {
                name: name.to_string(),
                devtype: Some("partition".to_string()),
                fs_type: fs.map(str::to_string),
                fs_uuid: fs.map(|_| format!("uuid-{name}")),
                ..UdevInfo::default()
            },
            size: Mib(500),
            sysfs_path: format!("/sys/class/block/{disk}/{name}"),
            partition: Some(PartitionInfo {
                disk: disk.to_string(),
                number,
                part_type: PartType::Primary,
                start: 2048,
                length: 1_024_000,
                bootable: false,
            }),
            ..ProbedDevice::default()
        }
    }

    #[test]
    fn builds_disk_and_partition_with_formats() {
        let mut sda = disk("sda", Some("S1"), Mib(10_000));
        sda.disklabel = Some("msdos".to_string());
        let snapshot = ProbeSnapshot {
            devices: vec![sda, partition("sda1", "sda", 1, Some("ext4"))],
            ..ProbeSnapshot::default()
        };

        let mut tree = DeviceTree::new(StorageConfig::default());
        let runner = ScriptedRunner::new();
        populate(&mut tree, &snapshot, &runner).unwrap();

        assert!(tree.populated);
        let sda = tree.get_by_name("sda").unwrap();
        assert_eq!(sda.format().unwrap().type_name(), "msdos");
        assert_eq!(sda.common.kids, 1);

        let sda1 = tree.get_by_name("sda1").unwrap();
        assert_eq!(sda1.format().unwrap().type_name(), "ext4");
        assert_eq!(sda1.common.parents, vec![sda.id]);
        assert_eq!(sda1.as_partition().unwrap().number, Some(1));
    }

    #[test]
    fn multipath_group_collapses_and_members_get_format() {
        let snapshot = ProbeSnapshot {
            devices: vec![
                disk("sda", Some("S1"), Mib(10_000)),
                disk("sdc", Some("S1"), Mib(10_000)),
                disk("sdb", Some("S2"), Mib(5_000)),
                {
                    let mut d = disk("sde", Some("S3"), Mib(100));
                    d.info.usb_driver = Some("usb-storage".to_string());
                    d
                },
                {
                    let mut d = disk("sdf", Some("S3"), Mib(100));
                    d.info.usb_driver = Some("usb-storage".to_string());
                    d
                },
            ],
            ..ProbeSnapshot::default()
        };

        let mut tree = DeviceTree::new(StorageConfig::default());
        let runner = ScriptedRunner::new();
        populate(&mut tree, &snapshot, &runner).unwrap();

        let mpath = tree.get_by_name("mpatha").expect("one multipath device");
        assert_eq!(mpath.common.parents.len(), 2);
        for member in ["sda", "sdc"] {
            let device = tree.get_by_name(member).unwrap();
            assert_eq!(device.format().unwrap().type_name(), "multipath_member");
        }
        // The card-reader pair stays as independent disks.
        assert!(tree.get_by_name("sde").unwrap().format().is_none());
        assert!(tree.get_by_name("sdf").unwrap().format().is_none());
    }

    #[test]
    fn ignored_disks_feed_the_lvm_filter() {
        let mut config = StorageConfig::default();
        config.ignored_disks.push("sdb".to_string());
        let snapshot = ProbeSnapshot {
            devices: vec![
                disk("sda", Some("S1"), Mib(10_000)),
                disk("sdb", Some("S2"), Mib(10_000)),
            ],
            ..ProbeSnapshot::default()
        };

        let mut tree = DeviceTree::new(config);
        let runner = ScriptedRunner::new();
        populate(&mut tree, &snapshot, &runner).unwrap();

        assert!(tree.get_by_name("sdb").is_none());
        assert_eq!(tree.lvm_ignored, vec!["/dev/sdb".to_string()]);
    }

    #[test]
    fn lvm_chain_is_built_from_reports() {
        let mut sda = disk("sda", Some("S1"), Mib(10_000));
        sda.disklabel = Some("msdos".to_string());
        let mut pv_part = partition("sda2", "sda", 2, Some("LVM2_member"));
        pv_part.info.fs_uuid = Some("pv-uuid-1".to_string());

        let snapshot = ProbeSnapshot {
            devices: vec![sda, partition("sda1", "sda", 1, Some("ext4")), pv_part],
            vgs: vec![VgReport {
                name: "vg0".to_string(),
                uuid: "vg-uuid-1".to_string(),
                pe_size: Mib(4),
                pe_count: 1000,
                pe_free: 100,
                pv_count: 1,
                lv_count: 2,
            }],
            lvs: vec![
                LvReport {
                    vg_name: "vg0".to_string(),
                    lv_name: "root".to_string(),
                    uuid: "lv-uuid-1".to_string(),
                    size: Mib(3000),
                    attr: "-wi-ao----".to_string(),
                    origin: None,
                },
                LvReport {
                    vg_name: "vg0".to_string(),
                    lv_name: "snap".to_string(),
                    uuid: "lv-uuid-2".to_string(),
                    size: Mib(500),
                    attr: "swi-a-s---".to_string(),
                    origin: Some("root".to_string()),
                },
            ],
            pvs: vec![PvReport {
                pv_name: "/dev/sda2".to_string(),
                uuid: "pv-uuid-1".to_string(),
                vg_name: Some("vg0".to_string()),
                vg_uuid: Some("vg-uuid-1".to_string()),
                pe_start: Mib(1),
                size: Mib(4000),
                free: Mib(400),
            }],
            ..ProbeSnapshot::default()
        };

        let mut tree = DeviceTree::new(StorageConfig::default());
        let runner = ScriptedRunner::new();
        populate(&mut tree, &snapshot, &runner).unwrap();

        let vg = tree.get_by_name("vg0").expect("vg built");
        assert_eq!(vg.as_vg().unwrap().lvs.len(), 1, "snapshot LV not modelled");

        let root = tree.get_by_name("vg0-root").expect("lv built");
        assert_eq!(root.common.parents, vec![vg.id]);
        match &root.kind {
            DeviceExt::LvmLogicalVolume(ext) => {
                assert_eq!(ext.snapshot_space, Mib(500), "snapshot credited to origin");
            }
            other => panic!("expected LV, got {other:?}"),
        }

        let pv = tree.get_by_name("sda2").unwrap();
        assert!(pv.format().unwrap().is_pv());
        assert!(!pv.is_leaf());
    }

    #[test]
    fn incomplete_vg_dropped_only_with_zero_mbr() {
        let build = |zero_mbr: bool| {
            let mut pv_part = partition("sda2", "sda", 2, Some("LVM2_member"));
            pv_part.info.fs_uuid = Some("pv-uuid-1".to_string());
            let mut sda = disk("sda", Some("S1"), Mib(10_000));
            sda.disklabel = Some("msdos".to_string());
            let snapshot = ProbeSnapshot {
                devices: vec![sda, pv_part],
                vgs: vec![VgReport {
                    name: "vg0".to_string(),
                    uuid: "vg-uuid-1".to_string(),
                    pe_size: Mib(4),
                    pe_count: 1000,
                    pe_free: 100,
                    pv_count: 2, // claims two PVs, only one visible
                    lv_count: 1,
                }],
                lvs: vec![LvReport {
                    vg_name: "vg0".to_string(),
                    lv_name: "root".to_string(),
                    uuid: "lv-uuid-1".to_string(),
                    size: Mib(3000),
                    attr: "-wi-ao----".to_string(),
                    origin: None,
                }],
                pvs: vec![PvReport {
                    pv_name: "/dev/sda2".to_string(),
                    uuid: "pv-uuid-1".to_string(),
                    vg_name: Some("vg0".to_string()),
                    vg_uuid: Some("vg-uuid-1".to_string()),
                    pe_start: Mib(1),
                    size: Mib(4000),
                    free: Mib(400),
                }],
                ..ProbeSnapshot::default()
            };
            let mut config = StorageConfig::default();
            config.zero_mbr = zero_mbr;
            let mut tree = DeviceTree::new(config);
            let runner = ScriptedRunner::new();
            populate(&mut tree, &snapshot, &runner).unwrap();
            tree
        };

        let kept = build(false);
        assert!(kept.get_by_name("vg0").is_some());

        let dropped = build(true);
        assert!(dropped.get_by_name("vg0").is_none());
        assert!(dropped.get_by_name("vg0-root").is_none());
        let pv = dropped.get_by_name("sda2").unwrap();
        assert_eq!(pv.format().unwrap().type_name(), "unknown");
        assert!(dropped.lvm_ignored.contains(&"/dev/sda2".to_string()));
    }

    #[test]
    fn md_member_without_assembled_array_creates_one() {
        let mut sda = disk("sda", Some("S1"), Mib(10_000));
        sda.disklabel = Some("msdos".to_string());
        let mut sdb = disk("sdb", Some("S2"), Mib(10_000));
        sdb.disklabel = Some("msdos".to_string());
        let mut m1 = partition("sda1", "sda", 1, Some("linux_raid_member"));
        m1.info.md_uuid = Some("aa:bb:cc".to_string());
        let mut m2 = partition("sdb1", "sdb", 1, Some("linux_raid_member"));
        m2.info.md_uuid = Some("aa:bb:cc".to_string());

        let snapshot = ProbeSnapshot {
            devices: vec![sda, sdb, m1, m2],
            md_arrays: vec![MdScanEntry {
                device: "/dev/md0".to_string(),
                uuid: Some("aa:bb:cc".to_string()),
                level: Some("raid1".to_string()),
                metadata: Some("1.2".to_string()),
                container: None,
                num_devices: Some(2),
            }],
            ..ProbeSnapshot::default()
        };

        let mut tree = DeviceTree::new(StorageConfig::default());
        let runner = ScriptedRunner::new();
        populate(&mut tree, &snapshot, &runner).unwrap();

        let array = tree.get_by_name("md0").expect("array synthesized from scan");
        assert_eq!(array.common.parents.len(), 2);
        assert_eq!(array.as_md().unwrap().uuid.as_deref(), Some("aa:bb:cc"));
        assert!(!tree.get_by_name("sda1").unwrap().is_leaf());
    }

    #[test]
    fn protected_specs_mark_devices() {
        let mut sda1 = partition("sda1", "sda", 1, Some("ext4"));
        sda1.info.fs_uuid = Some("live-uuid".to_string());
        let snapshot = ProbeSnapshot {
            devices: vec![disk("sda", None, Mib(10_000)), sda1],
            ..ProbeSnapshot::default()
        };

        let mut config = StorageConfig::default();
        config.protected_specs.push("UUID=live-uuid".to_string());
        let mut tree = DeviceTree::new(config);
        let runner = ScriptedRunner::new();
        populate(&mut tree, &snapshot, &runner).unwrap();

        assert!(tree.get_by_name("sda1").unwrap().common.protected);
        assert!(!tree.get_by_name("sda").unwrap().common.protected);
    }

    #[test]
    fn teardown_deactivates_composite_leaves() {
        let mut pv_part = partition("sda2", "sda", 2, Some("LVM2_member"));
        pv_part.info.fs_uuid = Some("pv-uuid-1".to_string());
        let snapshot = ProbeSnapshot {
            devices: vec![disk("sda", None, Mib(10_000)), pv_part],
            vgs: vec![VgReport {
                name: "vg0".to_string(),
                uuid: "vg-uuid-1".to_string(),
                pe_size: Mib(4),
                pe_count: 1000,
                pe_free: 1000,
                pv_count: 1,
                lv_count: 0,
            }],
            pvs: vec![PvReport {
                pv_name: "/dev/sda2".to_string(),
                uuid: "pv-uuid-1".to_string(),
                vg_name: Some("vg0".to_string()),
                vg_uuid: Some("vg-uuid-1".to_string()),
                pe_start: Mib(1),
                size: Mib(4000),
                free: Mib(4000),
            }],
            ..ProbeSnapshot::default()
        };

        let mut tree = DeviceTree::new(StorageConfig::default());
        let runner = ScriptedRunner::new();
        populate(&mut tree, &snapshot, &runner).unwrap();

        assert!(runner.saw("lvm", &["vgchange", "-a", "n", "vg0"]));
        assert!(runner.saw("udevadm", &["settle"]));
    }
}
