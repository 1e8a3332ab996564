// SPDX-License-Identifier: GPL-3.0-only

//! Action execution
//!
//! Takes the registered queue, prunes and sorts it, then drives the system
//! tools action by action. Disklabel reads and writes go through the
//! `DiskIo` seam so the whole commit path runs in tests against an
//! in-memory disk. A failed label commit gets one retry after tearing down
//! every active composite device; stale device-mapper or MD holds are the
//! usual culprit.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use storage_sys::disklabel::{self, DiskLabelIo, LabelPartition, PartitionTypeHint};
use storage_sys::{crypto, fsops, lvm, mdraid, multipath, udev, wipe, Runner, SysError};
use storage_types::{
    Action, ActionKind, Device, DeviceExt, FormatExt, FsType, MdKind, Mib, ObjectKind, PartType,
};

use crate::actions::{prune_actions, sort_actions, ProgressSink};
use crate::error::{DeviceOp, Result, StorageError};
use crate::tree::DeviceTree;

/// Disklabel and metadata-wipe seam.
pub trait DiskIo {
    fn read(&self, device: &str) -> storage_sys::Result<DiskLabelIo>;
    fn commit(&self, device: &str, label: &DiskLabelIo) -> storage_sys::Result<()>;
    fn wipe(&self, device: &str, size: Mib) -> storage_sys::Result<()>;
}

/// Reads and writes real block devices.
#[derive(Debug, Default)]
pub struct SystemDiskIo;

impl DiskIo for SystemDiskIo {
    fn read(&self, device: &str) -> storage_sys::Result<DiskLabelIo> {
        disklabel::read_label(Path::new(device))
    }

    fn commit(&self, device: &str, label: &DiskLabelIo) -> storage_sys::Result<()> {
        disklabel::commit_label(Path::new(device), label)
    }

    fn wipe(&self, device: &str, size: Mib) -> storage_sys::Result<()> {
        wipe::wipe_metadata(Path::new(device), size)
    }
}

/// Keeps labels in memory and records wipes. Commits can be scripted to
/// fail, which is how the teardown-and-retry path gets exercised.
#[derive(Debug, Default)]
pub struct MemoryDiskIo {
    labels: Mutex<BTreeMap<String, DiskLabelIo>>,
    commit_failures: Mutex<BTreeMap<String, u32>>,
    wipes: Mutex<Vec<(String, Mib)>>,
}

impl MemoryDiskIo {
    pub fn new() -> Self {
        MemoryDiskIo::default()
    }

    pub fn set_label(&self, device: &str, label: DiskLabelIo) {
        self.labels
            .lock()
            .unwrap()
            .insert(device.to_string(), label);
    }

    pub fn label(&self, device: &str) -> Option<DiskLabelIo> {
        self.labels.lock().unwrap().get(device).cloned()
    }

    /// The next `times` commits on `device` fail with a commit error.
    pub fn fail_next_commit(&self, device: &str, times: u32) {
        self.commit_failures
            .lock()
            .unwrap()
            .insert(device.to_string(), times);
    }

    pub fn wipes(&self) -> Vec<(String, Mib)> {
        self.wipes.lock().unwrap().clone()
    }
}

impl DiskIo for MemoryDiskIo {
    fn read(&self, device: &str) -> storage_sys::Result<DiskLabelIo> {
        self.label(device)
            .ok_or_else(|| SysError::InvalidDiskLabel(device.to_string()))
    }

    fn commit(&self, device: &str, label: &DiskLabelIo) -> storage_sys::Result<()> {
        let mut failures = self.commit_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(device) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SysError::DiskLabelCommit {
                    device: device.to_string(),
                    detail: "scripted commit failure".to_string(),
                });
            }
        }
        drop(failures);
        self.set_label(device, label.clone());
        Ok(())
    }

    fn wipe(&self, device: &str, size: Mib) -> storage_sys::Result<()> {
        self.wipes.lock().unwrap().push((device.to_string(), size));
        Ok(())
    }
}

/// Prune, sort and execute the registered queue. The tree is frozen for
/// the duration; it stays frozen if execution fails partway, since the
/// queue no longer matches the on-disk state.
pub fn process_actions(
    tree: &mut DeviceTree,
    runner: &dyn Runner,
    disk_io: &dyn DiskIo,
    progress: &mut dyn ProgressSink,
) -> Result<()> {
    let mut queue = std::mem::take(tree.actions_mut());
    prune_actions(&mut queue);
    sort_actions(&mut queue, tree);

    tree.executing = true;
    progress.start("committing storage configuration", queue.len());

    let mut retried = false;
    let mut index = 0;
    while index < queue.len() {
        let action = queue[index].clone();
        info!(serial = action.serial, device = action.device, "executing action");
        match execute_action(tree, runner, disk_io, &action) {
            Ok(()) => {
                retried = false;
                index += 1;
                progress.set(index);
                if let Err(err) = udev::settle(runner) {
                    debug!("udev settle failed: {err}");
                }
                refresh_partition_names(tree, disk_io);
            }
            Err(err) if err.is_disklabel_commit() && !retried => {
                warn!("label commit failed, tearing down composites for one retry: {err}");
                teardown_composites(tree, runner);
                retried = true;
            }
            Err(err) => return Err(err),
        }
    }

    progress.pop();
    tree.executing = false;
    Ok(())
}

fn execute_action(
    tree: &mut DeviceTree,
    runner: &dyn Runner,
    disk_io: &dyn DiskIo,
    action: &Action,
) -> Result<()> {
    match (action.object, action.kind) {
        (ObjectKind::Device, ActionKind::Create) => create_device(tree, runner, disk_io, action),
        (ObjectKind::Device, ActionKind::Destroy) => destroy_device(tree, runner, disk_io, action),
        (ObjectKind::Device, ActionKind::Resize(_)) => resize_device(tree, runner, disk_io, action),
        (ObjectKind::Device, ActionKind::Migrate) => Err(StorageError::DeviceAction(
            "devices do not migrate".to_string(),
        )),
        (ObjectKind::Format, ActionKind::Create) => create_format(tree, runner, disk_io, action),
        (ObjectKind::Format, ActionKind::Destroy) => destroy_format(tree, runner, disk_io, action),
        (ObjectKind::Format, ActionKind::Resize(_)) => resize_format(tree, runner, action),
        (ObjectKind::Format, ActionKind::Migrate) => migrate_format(tree, runner, action),
    }
}

fn lvm_filter(tree: &DeviceTree) -> Option<String> {
    lvm::filter_config(&tree.lvm_ignored)
}

/// VG and LV names for a logical volume device, whose tree name is
/// `<vg>-<lv>`.
fn lv_names(tree: &DeviceTree, device: &Device) -> Option<(String, String)> {
    let parent = device
        .common
        .parents
        .first()
        .and_then(|&p| tree.peek(p))?;
    let vg = parent.name().to_string();
    let lv = device
        .name()
        .strip_prefix(&format!("{vg}-"))
        .unwrap_or(device.name())
        .to_string();
    Some((vg, lv))
}

fn parent_paths(tree: &DeviceTree, device: &Device) -> Vec<String> {
    device
        .common
        .parents
        .iter()
        .filter_map(|&p| tree.peek(p))
        .map(|d| d.path())
        .collect()
}

/// MBR system byte / GPT type GUID choice for a partition, from the
/// payload it will carry.
fn type_hint_for(device: &Device) -> PartitionTypeHint {
    if let Some(ext) = device.as_partition() {
        if ext.part_type == PartType::Extended {
            return PartitionTypeHint::Extended;
        }
    }
    match device.format().map(|f| &f.kind) {
        Some(FormatExt::LvmPv(_)) => PartitionTypeHint::Lvm,
        Some(FormatExt::MdMember(_)) => PartitionTypeHint::Raid,
        Some(FormatExt::Filesystem(fs)) => match fs.fs_type {
            FsType::Swap => PartitionTypeHint::Swap,
            FsType::Efi => PartitionTypeHint::Esp,
            FsType::AppleBootstrap => PartitionTypeHint::AppleBoot,
            _ => PartitionTypeHint::LinuxFs,
        },
        _ => PartitionTypeHint::LinuxFs,
    }
}

fn kind_name(device: &Device) -> &'static str {
    match device.kind {
        DeviceExt::Disk(_) => "disk",
        DeviceExt::Partition(_) => "partition",
        DeviceExt::MdArray(_) => "md array",
        DeviceExt::DmRaidArray(_) => "dmraid array",
        DeviceExt::Multipath(_) => "multipath",
        DeviceExt::LvmVolumeGroup(_) => "volume group",
        DeviceExt::LvmLogicalVolume(_) => "logical volume",
        DeviceExt::Luks(_) => "luks mapping",
        DeviceExt::File => "file",
        DeviceExt::Directory => "directory",
        DeviceExt::Nfs => "nfs",
        DeviceExt::NoDevice => "nodev",
    }
}

/// Format operations change what blkid reports; poke the kernel so the
/// udev db catches up. Best effort, a missing sysfs node is not fatal.
fn uevent_change(device: &Device) {
    let Some(sysfs) = device.common.sysfs_path.as_deref() else {
        return;
    };
    if let Err(err) = udev::trigger_change(sysfs) {
        debug!(device = device.name(), "uevent trigger failed: {err}");
    }
}

fn device_or_err(tree: &DeviceTree, action: &Action) -> Result<Device> {
    tree.peek(action.device).cloned().ok_or_else(|| {
        StorageError::DeviceTree(format!("action {} names unknown device", action.serial))
    })
}

fn create_device(
    tree: &mut DeviceTree,
    runner: &dyn Runner,
    disk_io: &dyn DiskIo,
    action: &Action,
) -> Result<()> {
    let device = device_or_err(tree, action)?;
    let path = device.path();

    match &device.kind {
        DeviceExt::Partition(ext) => {
            let disk = device
                .common
                .parents
                .first()
                .and_then(|&p| tree.peek(p))
                .cloned()
                .ok_or_else(|| StorageError::Partitioning(format!("{path} has no disk")))?;
            let geometry = ext.geometry.ok_or_else(|| {
                StorageError::Partitioning(format!("{path} was never allocated"))
            })?;
            let number = ext.number.ok_or_else(|| {
                StorageError::Partitioning(format!("{path} has no partition number"))
            })?;
            let disk_path = disk.path();
            let mut label = disk_io.read(&disk_path)?;
            label.partitions.retain(|p| p.number != number);
            label.partitions.push(LabelPartition {
                number,
                part_type: ext.part_type,
                type_hint: type_hint_for(&device),
                start: geometry.start,
                length: geometry.length,
                bootable: ext.bootable,
                name: None,
                gpt_type: None,
                gpt_guid: None,
            });
            label.partitions.sort_by_key(|p| p.number);
            disk_io.commit(&disk_path, &label)?;
        }
        DeviceExt::MdArray(ext) => {
            let members = parent_paths(tree, &device);
            let refs: Vec<&str> = members.iter().map(String::as_str).collect();
            let spares = ext.total_devices.saturating_sub(ext.member_count) as usize;
            mdraid::create(runner, &path, ext.level, &refs, spares, ext.bitmap)?;
        }
        DeviceExt::LvmVolumeGroup(ext) => {
            let pvs = parent_paths(tree, &device);
            let refs: Vec<&str> = pvs.iter().map(String::as_str).collect();
            let pe_size = if ext.pe_size.is_zero() { Mib(4) } else { ext.pe_size };
            lvm::vg_create(runner, &lvm_filter(tree), device.name(), pe_size, &refs)?;
        }
        DeviceExt::LvmLogicalVolume(_) => {
            let (vg, lv) = lv_names(tree, &device)
                .ok_or_else(|| StorageError::Lvm(format!("{path} has no volume group")))?;
            lvm::lv_create(runner, &lvm_filter(tree), &vg, &lv, device.size())?;
        }
        DeviceExt::Luks(ext) => {
            let backing = device
                .common
                .parents
                .first()
                .and_then(|&p| tree.peek(p))
                .map(|d| d.path())
                .ok_or_else(|| StorageError::Luks {
                    device: path.clone(),
                    detail: "no backing device".to_string(),
                })?;
            let passphrase = tree
                .peek(device.common.parents[0])
                .and_then(|d| d.format())
                .and_then(|f| match &f.kind {
                    FormatExt::Luks(l) => l.passphrase.clone(),
                    _ => None,
                })
                .or_else(|| tree.config.passphrase_for(&backing).map(String::from))
                .ok_or_else(|| StorageError::Luks {
                    device: backing.clone(),
                    detail: "no passphrase available".to_string(),
                })?;
            crypto::luks_open(runner, &backing, &ext.map_name, &passphrase)?;
        }
        _ => {
            return Err(StorageError::Device {
                op: DeviceOp::Create,
                device: path,
                detail: format!("cannot create a {}", kind_name(&device)),
            });
        }
    }

    if let Some(d) = tree.get_mut(action.device) {
        d.common.exists = true;
    }
    Ok(())
}

fn destroy_device(
    tree: &mut DeviceTree,
    runner: &dyn Runner,
    disk_io: &dyn DiskIo,
    action: &Action,
) -> Result<()> {
    let device = device_or_err(tree, action)?;
    let path = device.path();

    match &device.kind {
        DeviceExt::Partition(ext) => {
            let disk = device
                .common
                .parents
                .first()
                .and_then(|&p| tree.peek(p))
                .cloned()
                .ok_or_else(|| StorageError::Partitioning(format!("{path} has no disk")))?;
            let number = ext.number.ok_or_else(|| {
                StorageError::Partitioning(format!("{path} has no partition number"))
            })?;
            let disk_path = disk.path();
            let mut label = disk_io.read(&disk_path)?;
            label.partitions.retain(|p| p.number != number);
            disk_io.commit(&disk_path, &label)?;
        }
        DeviceExt::MdArray(_) => mdraid::deactivate(runner, &path)?,
        DeviceExt::LvmVolumeGroup(_) => {
            lvm::vg_remove(runner, &lvm_filter(tree), device.name())?
        }
        DeviceExt::LvmLogicalVolume(_) => {
            let (vg, lv) = lv_names(tree, &device)
                .ok_or_else(|| StorageError::Lvm(format!("{path} has no volume group")))?;
            lvm::lv_remove(runner, &lvm_filter(tree), &vg, &lv)?;
        }
        DeviceExt::Luks(ext) => crypto::luks_close(runner, &ext.map_name)?,
        DeviceExt::Multipath(_) => multipath::flush(runner, device.name())?,
        _ => {
            return Err(StorageError::Device {
                op: DeviceOp::Destroy,
                device: path,
                detail: format!("cannot destroy a {}", kind_name(&device)),
            });
        }
    }
    Ok(())
}

fn resize_device(
    tree: &mut DeviceTree,
    runner: &dyn Runner,
    disk_io: &dyn DiskIo,
    action: &Action,
) -> Result<()> {
    let device = device_or_err(tree, action)?;
    let path = device.path();
    let new_size = action.new_size.ok_or_else(|| {
        StorageError::DeviceAction(format!("resize of {path} carries no size"))
    })?;

    match &device.kind {
        DeviceExt::Partition(ext) => {
            let disk = device
                .common
                .parents
                .first()
                .and_then(|&p| tree.peek(p))
                .cloned()
                .ok_or_else(|| StorageError::Partitioning(format!("{path} has no disk")))?;
            let number = ext.number.ok_or_else(|| {
                StorageError::Partitioning(format!("{path} has no partition number"))
            })?;
            let disk_path = disk.path();
            let mut label = disk_io.read(&disk_path)?;
            let entry = label
                .partitions
                .iter_mut()
                .find(|p| p.number == number)
                .ok_or_else(|| {
                    StorageError::Partitioning(format!("{path} is not on the label"))
                })?;
            entry.length = new_size.to_sectors();
            disk_io.commit(&disk_path, &label)?;
            if let Some(geometry) = tree
                .get_mut(action.device)
                .and_then(|d| d.as_partition_mut())
                .and_then(|p| p.geometry.as_mut())
            {
                geometry.length = new_size.to_sectors();
            }
        }
        DeviceExt::LvmLogicalVolume(_) => {
            let (vg, lv) = lv_names(tree, &device)
                .ok_or_else(|| StorageError::Lvm(format!("{path} has no volume group")))?;
            lvm::lv_resize(runner, &lvm_filter(tree), &vg, &lv, new_size)?;
        }
        _ => {
            return Err(StorageError::Device {
                op: DeviceOp::Resize,
                device: path,
                detail: format!("cannot resize a {}", kind_name(&device)),
            });
        }
    }

    if let Some(d) = tree.get_mut(action.device) {
        d.common.size = new_size;
        d.common.target_size = None;
    }
    Ok(())
}

fn create_format(
    tree: &mut DeviceTree,
    runner: &dyn Runner,
    disk_io: &dyn DiskIo,
    action: &Action,
) -> Result<()> {
    let device = device_or_err(tree, action)?;
    let path = device.path();
    let format = action
        .format
        .clone()
        .or_else(|| device.common.format.clone())
        .ok_or_else(|| StorageError::Format {
            op: DeviceOp::Create,
            device: path.clone(),
            detail: "action carries no format".to_string(),
        })?;

    match &format.kind {
        FormatExt::DiskLabel(ext) => {
            let label = DiskLabelIo {
                label_type: ext.label_type,
                disk_sectors: device.size().to_sectors(),
                disk_guid: None,
                partitions: Vec::new(),
            };
            disk_io.commit(&path, &label)?;
        }
        FormatExt::Filesystem(fs) => {
            fsops::mkfs(runner, &fs.fs_type, &path, format.common.label.as_deref())?;
        }
        FormatExt::Luks(ext) => {
            let passphrase = ext
                .passphrase
                .clone()
                .or_else(|| tree.config.passphrase_for(&path).map(String::from))
                .ok_or_else(|| StorageError::Luks {
                    device: path.clone(),
                    detail: "no passphrase available".to_string(),
                })?;
            crypto::luks_format(runner, &path, &passphrase, &ext.cipher, ext.key_size_bits)?;
            // The header UUID decides the mapping name; rename any planned
            // mapping registered before the UUID existed.
            let uuid = crypto::luks_uuid(runner, &path)?;
            let map_name = format!("luks-{uuid}");
            if let Some(f) = tree
                .get_mut(action.device)
                .and_then(|d| d.common.format.as_mut())
            {
                f.common.uuid = Some(uuid.clone());
                if let FormatExt::Luks(l) = &mut f.kind {
                    l.map_name = Some(map_name.clone());
                }
            }
            for child in tree.children_of(action.device) {
                if let Some(d) = tree.get_mut(child) {
                    if let DeviceExt::Luks(l) = &mut d.kind {
                        l.map_name = map_name.clone();
                        d.common.name = map_name.clone();
                    }
                }
            }
            if let Some(cert) = &ext.escrow_cert {
                let backup = if ext.backup_passphrase {
                    Some(uuid::Uuid::new_v4().to_string())
                } else {
                    None
                };
                crypto::write_escrow_packet(
                    runner,
                    &path,
                    &passphrase,
                    cert,
                    Path::new("/root"),
                    backup.as_deref(),
                )?;
            }
        }
        FormatExt::LvmPv(_) => lvm::pv_create(runner, &lvm_filter(tree), &path)?,
        // mdadm --create writes member superblocks when the array appears.
        FormatExt::MdMember(_) => {}
        FormatExt::DmRaidMember | FormatExt::MultipathMember | FormatExt::Unknown => {}
    }

    if let Some(f) = tree
        .get_mut(action.device)
        .and_then(|d| d.common.format.as_mut())
    {
        f.common.exists = true;
        f.common.device = Some(path);
    }
    uevent_change(&device);
    Ok(())
}

fn destroy_format(
    tree: &mut DeviceTree,
    runner: &dyn Runner,
    disk_io: &dyn DiskIo,
    action: &Action,
) -> Result<()> {
    let device = device_or_err(tree, action)?;
    let path = device.path();
    let format = action.format.clone().ok_or_else(|| StorageError::Format {
        op: DeviceOp::Destroy,
        device: path.clone(),
        detail: "action carries no format".to_string(),
    })?;

    match &format.kind {
        FormatExt::MdMember(_) => mdraid::destroy_member(runner, &path)?,
        FormatExt::LvmPv(_) => lvm::pv_remove(runner, &lvm_filter(tree), &path)?,
        _ => {}
    }
    // Zero both metadata spans so nothing re-identifies the old signature.
    disk_io.wipe(&path, device.size())?;
    uevent_change(&device);
    Ok(())
}

fn resize_format(tree: &mut DeviceTree, runner: &dyn Runner, action: &Action) -> Result<()> {
    let device = device_or_err(tree, action)?;
    let path = device.path();
    let fs = device
        .format()
        .and_then(|f| f.as_fs())
        .cloned()
        .ok_or_else(|| StorageError::FsResize {
            device: path.clone(),
            detail: "no filesystem".to_string(),
        })?;
    let new_size = action.new_size.ok_or_else(|| StorageError::FsResize {
        device: path.clone(),
        detail: "resize carries no size".to_string(),
    })?;

    // Shrinks are bounded by the filesystem's own reported minimum,
    // queried once and cached on the format.
    if new_size < device.size() {
        let min = match fs.min_size {
            Some(min) => Some(min),
            None => match fs.fs_type {
                FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
                    Some(fsops::ext_min_size(runner, &path)?)
                }
                FsType::Ntfs => Some(fsops::ntfs_min_size(runner, &path)?),
                _ => None,
            },
        };
        if let Some(min) = min {
            if let Some(fs) = tree
                .get_mut(action.device)
                .and_then(|d| d.common.format.as_mut())
                .and_then(|f| f.as_fs_mut())
            {
                fs.min_size = Some(min);
            }
            if new_size < min {
                return Err(StorageError::FsResize {
                    device: path,
                    detail: format!("{new_size} is below the filesystem minimum of {min}"),
                });
            }
        }
    }

    fsops::fsck(runner, &fs.fs_type, &path)?;
    fsops::resize(runner, &fs.fs_type, &path, new_size)?;

    if let Some(fs) = tree
        .get_mut(action.device)
        .and_then(|d| d.common.format.as_mut())
        .and_then(|f| f.as_fs_mut())
    {
        fs.target_size = None;
    }
    Ok(())
}

fn migrate_format(tree: &mut DeviceTree, runner: &dyn Runner, action: &Action) -> Result<()> {
    let device = device_or_err(tree, action)?;
    let path = device.path();
    let fs = device
        .format()
        .and_then(|f| f.as_fs())
        .cloned()
        .ok_or_else(|| StorageError::FsMigrate {
            device: path.clone(),
            detail: "no filesystem".to_string(),
        })?;
    let target = fs.migrate_to.clone().ok_or_else(|| StorageError::FsMigrate {
        device: path.clone(),
        detail: "no migration target".to_string(),
    })?;

    fsops::migrate(runner, &fs.fs_type, &target, &path)?;

    if let Some(fs) = tree
        .get_mut(action.device)
        .and_then(|d| d.common.format.as_mut())
        .and_then(|f| f.as_fs_mut())
    {
        fs.fs_type = target;
        fs.migrate_to = None;
    }
    uevent_change(&device);
    Ok(())
}

/// Re-derive every partition's number and kernel name from its disk's
/// committed label. Rewriting an EBR chain renumbers logical siblings,
/// so after each action the tree must track the kernel's view or later
/// actions format stale device paths. Entries are matched by start
/// sector, which actions never change.
fn refresh_partition_names(tree: &mut DeviceTree, disk_io: &dyn DiskIo) {
    let disks: Vec<(u32, String, String)> = tree
        .devices()
        .filter(|d| d.is_partitionable() && d.common.exists)
        .map(|d| (d.id, d.name().to_string(), d.path()))
        .collect();
    for (disk_id, disk_name, disk_path) in disks {
        let Ok(label) = disk_io.read(&disk_path) else {
            continue;
        };
        for child in tree.children_of(disk_id) {
            let start = match tree
                .get(child)
                .and_then(|d| d.as_partition())
                .and_then(|p| p.geometry)
            {
                Some(geometry) => geometry.start,
                None => continue,
            };
            let Some(entry) = label.partitions.iter().find(|p| p.start == start) else {
                continue;
            };
            let name = format!("{disk_name}{}", entry.number);
            if let Some(device) = tree.get_mut(child) {
                if device.common.name != name {
                    debug!(
                        from = device.common.name.as_str(),
                        to = name.as_str(),
                        "partition renumbered"
                    );
                    device.common.name = name;
                }
                if let Some(part) = device.as_partition_mut() {
                    part.number = Some(entry.number);
                }
            }
        }
    }
}

/// Deactivate every active composite, deepest first. Errors are logged
/// and swallowed; this only runs to clear holds before a commit retry.
fn teardown_composites(tree: &DeviceTree, runner: &dyn Runner) {
    let mut composites: Vec<&Device> = tree
        .devices()
        .filter(|d| d.is_composite() && d.common.exists)
        .collect();
    composites.sort_by_key(|d| std::cmp::Reverse(tree.depth(d.id)));

    let filter = lvm_filter(tree);
    for device in composites {
        let result = match &device.kind {
            DeviceExt::LvmLogicalVolume(_) => match lv_names(tree, device) {
                Some((vg, lv)) => lvm::lv_deactivate(runner, &filter, &vg, &lv),
                None => Ok(()),
            },
            DeviceExt::LvmVolumeGroup(_) => lvm::vg_deactivate(runner, &filter, device.name()),
            DeviceExt::MdArray(ext) if ext.kind != MdKind::Container => {
                mdraid::deactivate(runner, &device.path())
            }
            DeviceExt::Luks(ext) => crypto::luks_close(runner, &ext.map_name),
            DeviceExt::Multipath(_) => multipath::flush(runner, device.name()),
            _ => Ok(()),
        };
        if let Err(err) = result {
            debug!(device = device.name(), "teardown failed: {err}");
        }
    }
}

/// Mount every filesystem under `base`, shallow mountpoints first, then
/// enable swap spaces.
pub fn mount_filesystems(tree: &mut DeviceTree, runner: &dyn Runner, base: &Path) -> Result<()> {
    for (mountpoint, id) in tree.mountpoints() {
        let device = tree.get(id).cloned().ok_or_else(|| {
            StorageError::DeviceTree(format!("mountpoint {mountpoint} names unknown device"))
        })?;
        let fs = device
            .format()
            .and_then(|f| f.as_fs())
            .cloned()
            .ok_or_else(|| {
                StorageError::DeviceTree(format!("{} has no filesystem", device.name()))
            })?;
        if !fs.fs_type.is_mountable() {
            continue;
        }
        let rel = mountpoint.trim_start_matches('/');
        let target = if rel.is_empty() {
            base.to_path_buf()
        } else {
            base.join(rel)
        };
        fs::create_dir_all(&target)?;
        info!(device = device.name(), mountpoint, "mounting");
        let options = device.format().and_then(|f| f.common.options.clone());
        fsops::mount_fs(&device.path(), &target, fs.fs_type.as_str(), options.as_deref())?;
        if let Some(fs) = tree
            .get_mut(id)
            .and_then(|d| d.common.format.as_mut())
            .and_then(|f| f.as_fs_mut())
        {
            fs.mounted = true;
        }
    }

    let swaps: Vec<String> = tree.swaps().iter().map(|d| d.path()).collect();
    for swap in swaps {
        fsops::swapon(runner, &swap)?;
    }
    Ok(())
}
