// SPDX-License-Identifier: GPL-3.0-only

//! The device tree
//!
//! Owns every device in an id-keyed arena, the ordered action queue, and
//! the engine configuration. Registration mutates the tree immediately so
//! later registrations see the post-action state; cancellation reverses
//! exactly that mutation. Parent links are ids, children are counted, so
//! VG/LV and device/format never hold owning references to each other.

use std::collections::BTreeMap;

use storage_types::{
    Action, ActionKind, Device, DeviceExt, DeviceId, Format, FormatExt, FsType, Mib, ObjectKind,
    ResizeDirection,
};

use crate::config::StorageConfig;
use crate::{Result, StorageError};

/// What a registration changed, kept so `cancel_action` can undo it.
#[derive(Debug)]
enum Undo {
    AddedDevice(DeviceId),
    RemovedDevice(Device),
    /// Create-device that displaced a same-path device first.
    ReplacedDevice {
        added: DeviceId,
        displaced: Device,
    },
    ReplacedFormat {
        device: DeviceId,
        old: Option<Format>,
    },
    RemovedFormat {
        device: DeviceId,
        old: Format,
    },
    SetTargetSize {
        device: DeviceId,
        old: Option<Mib>,
    },
    SetMigration {
        device: DeviceId,
    },
}

#[derive(Debug, Default)]
pub struct DeviceTree {
    devices: BTreeMap<DeviceId, Device>,
    /// Devices removed by destroy registrations. The sorter and executor
    /// still need their parents and geometry.
    retired: BTreeMap<DeviceId, Device>,
    next_id: DeviceId,
    actions: Vec<Action>,
    undo: BTreeMap<u64, Undo>,
    next_serial: u64,
    pub config: StorageConfig,
    /// Flips true when populate finishes.
    pub populated: bool,
    /// Execution has begun; registration and cancellation are refused.
    pub executing: bool,
    /// Device names appended to the LVM filter (ignored disks and
    /// inconsistent-VG members).
    pub lvm_ignored: Vec<String>,
    /// Kernel names resolved from the protected specs plus the live image
    /// backing device.
    pub protected_names: Vec<String>,
    /// crypttab adapter: map name -> backing device path.
    pub crypt_tab: BTreeMap<String, String>,
    /// blkid-tab adapter: device path -> filesystem uuid.
    pub blkid_tab: BTreeMap<String, String>,
}

impl DeviceTree {
    pub fn new(config: StorageConfig) -> Self {
        DeviceTree {
            config,
            ..DeviceTree::default()
        }
    }

    pub fn next_device_id(&mut self) -> DeviceId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn actions_mut(&mut self) -> &mut Vec<Action> {
        &mut self.actions
    }

    /// Insert a device, wiring up parent kid counts. The device's id must
    /// come from `next_device_id`.
    pub fn add_device(&mut self, device: Device) -> DeviceId {
        let id = device.id;
        self.retired.remove(&id);
        for parent in device.common.parents.clone() {
            if let Some(p) = self.devices.get_mut(&parent) {
                p.common.kids += 1;
            }
        }
        self.devices.insert(id, device);
        id
    }

    /// Remove a leaf device. The device is returned so destroy actions can
    /// re-add it on cancellation.
    pub fn remove_device(&mut self, id: DeviceId) -> Result<Device> {
        let device = self
            .devices
            .get(&id)
            .ok_or_else(|| StorageError::DeviceTree(format!("device {id} not in tree")))?;
        if device.common.kids > 0 {
            return Err(StorageError::DeviceTree(format!(
                "cannot remove {}: it has {} children",
                device.name(),
                device.common.kids
            )));
        }
        let device = self.devices.remove(&id).unwrap_or_else(|| unreachable!());
        self.retired.insert(id, device.clone());
        for parent in &device.common.parents {
            if let Some(p) = self.devices.get_mut(parent) {
                p.common.kids = p.common.kids.saturating_sub(1);
            }
        }
        // Drop the LV back-reference from its VG.
        if matches!(device.kind, DeviceExt::LvmLogicalVolume(_)) {
            for parent in &device.common.parents {
                if let Some(vg) = self.devices.get_mut(parent).and_then(|d| d.as_vg_mut()) {
                    vg.lvs.retain(|lv| *lv != id);
                }
            }
        }
        Ok(device)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.name() == name)
    }

    pub fn get_by_path(&self, path: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.path() == path)
    }

    pub fn get_by_sysfs_path(&self, sysfs: &str) -> Option<&Device> {
        self.devices
            .values()
            .find(|d| d.common.sysfs_path.as_deref() == Some(sysfs))
    }

    pub fn get_by_serial(&self, serial: &str) -> Option<&Device> {
        self.devices
            .values()
            .find(|d| d.common.serial.as_deref() == Some(serial))
    }

    /// UUID lookup; the format-level uuid wins over device-level metadata
    /// uuids because it is the persistent identifier.
    pub fn get_by_uuid(&self, uuid: &str) -> Option<&Device> {
        self.devices
            .values()
            .find(|d| {
                d.format()
                    .and_then(|f| f.common.uuid.as_deref())
                    .map(|u| u == uuid)
                    .unwrap_or(false)
            })
            .or_else(|| {
                self.devices.values().find(|d| match &d.kind {
                    DeviceExt::MdArray(ext) => ext.uuid.as_deref() == Some(uuid),
                    DeviceExt::LvmVolumeGroup(ext) => ext.uuid.as_deref() == Some(uuid),
                    _ => false,
                })
            })
    }

    pub fn get_by_label(&self, label: &str) -> Option<&Device> {
        self.devices.values().find(|d| {
            d.format()
                .and_then(|f| f.common.label.as_deref())
                .map(|l| l == label)
                .unwrap_or(false)
        })
    }

    /// Live or retired device by id; the sorter and executor consult
    /// retired devices for parents and geometry.
    pub fn peek(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id).or_else(|| self.retired.get(&id))
    }

    /// All ancestors of `id`, transitively, including retired ones.
    pub fn ancestors(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut seen = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(device) = self.peek(current) {
                for parent in &device.common.parents {
                    if !seen.contains(parent) {
                        seen.push(*parent);
                        stack.push(*parent);
                    }
                }
            }
        }
        seen
    }

    /// True iff `a` is stacked (transitively) on `b`.
    pub fn depends_on(&self, a: DeviceId, b: DeviceId) -> bool {
        self.ancestors(a).contains(&b)
    }

    /// Stacking depth: disks are 0, their partitions 1, and so on. A
    /// dependent always sits strictly deeper than anything it depends on.
    pub fn depth(&self, id: DeviceId) -> usize {
        self.ancestors(id).len()
    }

    pub fn children_of(&self, id: DeviceId) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| d.common.parents.contains(&id))
            .map(|d| d.id)
            .collect()
    }

    /// Devices carrying a filesystem format, the mount layout's raw
    /// material.
    pub fn filesystems(&self) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| matches!(d.format().map(|f| &f.kind), Some(FormatExt::Filesystem(_))))
            .collect()
    }

    /// Mountpoint -> device map for the rest of the installer.
    pub fn mountpoints(&self) -> BTreeMap<String, DeviceId> {
        let mut map = BTreeMap::new();
        for device in self.devices.values() {
            if let Some(mountpoint) = device.format().and_then(|f| f.mountpoint()) {
                map.insert(mountpoint.to_string(), device.id);
            }
        }
        map
    }

    /// Swap devices, for activation after execution.
    pub fn swaps(&self) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| {
                d.format()
                    .and_then(|f| f.as_fs())
                    .map(|fs| fs.fs_type == FsType::Swap)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn next_action_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn check_not_executing(&self) -> Result<()> {
        if self.executing {
            return Err(StorageError::DeviceAction(
                "action queue is frozen once execution begins".to_string(),
            ));
        }
        Ok(())
    }

    fn check_not_protected(&self, id: DeviceId) -> Result<()> {
        if let Some(device) = self.devices.get(&id) {
            if device.common.protected {
                return Err(StorageError::DeviceAction(format!(
                    "{} is protected",
                    device.name()
                )));
            }
        }
        Ok(())
    }

    /// Register a device creation. A preexisting same-path device is
    /// displaced first; pruning collapses the pattern later.
    pub fn register_create_device(&mut self, mut device: Device) -> Result<u64> {
        self.check_not_executing()?;
        device.common.exists = false;
        let path = device.path();
        let displaced = self
            .devices
            .values()
            .find(|d| d.path() == path)
            .map(|d| d.id);
        let displaced = match displaced {
            Some(old_id) => Some(self.remove_device(old_id)?),
            None => None,
        };

        let id = self.add_device(device);
        let serial = self.next_action_serial();
        self.actions.push(Action {
            serial,
            kind: ActionKind::Create,
            object: ObjectKind::Device,
            device: id,
            format: None,
            new_size: None,
        });
        self.undo.insert(
            serial,
            match displaced {
                Some(displaced) => Undo::ReplacedDevice { added: id, displaced },
                None => Undo::AddedDevice(id),
            },
        );
        Ok(serial)
    }

    /// Register a device destruction; the device leaves the tree now but
    /// is retained for cancellation.
    pub fn register_destroy_device(&mut self, id: DeviceId) -> Result<u64> {
        self.check_not_executing()?;
        self.check_not_protected(id)?;
        let device = self.remove_device(id)?;
        let serial = self.next_action_serial();
        self.actions.push(Action {
            serial,
            kind: ActionKind::Destroy,
            object: ObjectKind::Device,
            device: id,
            format: None,
            new_size: None,
        });
        self.undo.insert(serial, Undo::RemovedDevice(device));
        Ok(serial)
    }

    /// Register a format creation on an in-tree device. Fails when the
    /// format's mountpoint is already claimed.
    pub fn register_create_format(&mut self, id: DeviceId, format: Format) -> Result<u64> {
        self.check_not_executing()?;
        self.check_not_protected(id)?;
        if !self.devices.contains_key(&id) {
            return Err(StorageError::DeviceTree(format!("device {id} not in tree")));
        }
        if let Some(mountpoint) = format.mountpoint() {
            if self.mountpoints().contains_key(mountpoint) {
                return Err(StorageError::DeviceAction(format!(
                    "mountpoint {mountpoint} already in use"
                )));
            }
        }

        let device = self.devices.get_mut(&id).unwrap_or_else(|| unreachable!());
        let old = device.common.format.replace(format.clone());
        if device.common.original_format.is_none() {
            device.common.original_format = old.clone();
        }

        let serial = self.next_action_serial();
        self.actions.push(Action {
            serial,
            kind: ActionKind::Create,
            object: ObjectKind::Format,
            device: id,
            format: Some(format),
            new_size: None,
        });
        self.undo.insert(serial, Undo::ReplacedFormat { device: id, old });
        Ok(serial)
    }

    pub fn register_destroy_format(&mut self, id: DeviceId) -> Result<u64> {
        self.check_not_executing()?;
        self.check_not_protected(id)?;
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| StorageError::DeviceTree(format!("device {id} not in tree")))?;
        let old = device.common.format.take().ok_or_else(|| {
            StorageError::DeviceAction(format!("{} has no format to destroy", device.name()))
        })?;

        let serial = self.next_action_serial();
        self.actions.push(Action {
            serial,
            kind: ActionKind::Destroy,
            object: ObjectKind::Format,
            device: id,
            format: Some(old.clone()),
            new_size: None,
        });
        self.undo.insert(serial, Undo::RemovedFormat { device: id, old });
        Ok(serial)
    }

    pub fn register_resize_device(&mut self, id: DeviceId, new_size: Mib) -> Result<u64> {
        self.check_not_executing()?;
        self.check_not_protected(id)?;
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| StorageError::DeviceTree(format!("device {id} not in tree")))?;
        let direction = if new_size >= device.size() {
            ResizeDirection::Grow
        } else {
            ResizeDirection::Shrink
        };
        let old = device.common.target_size.replace(new_size);

        let serial = self.next_action_serial();
        self.actions.push(Action {
            serial,
            kind: ActionKind::Resize(direction),
            object: ObjectKind::Device,
            device: id,
            format: None,
            new_size: Some(new_size),
        });
        self.undo.insert(serial, Undo::SetTargetSize { device: id, old });
        Ok(serial)
    }

    pub fn register_resize_format(&mut self, id: DeviceId, new_size: Mib) -> Result<u64> {
        self.check_not_executing()?;
        self.check_not_protected(id)?;
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| StorageError::DeviceTree(format!("device {id} not in tree")))?;
        let current = device.size();
        let fs = device
            .common
            .format
            .as_mut()
            .and_then(|f| f.as_fs_mut())
            .ok_or_else(|| {
                StorageError::DeviceAction(format!("device {id} has no resizable filesystem"))
            })?;
        if !fs.fs_type.is_resizable() {
            return Err(StorageError::FsResize {
                device: id.to_string(),
                detail: format!("{} is not resizable", fs.fs_type.as_str()),
            });
        }
        let direction = if new_size >= current {
            ResizeDirection::Grow
        } else {
            ResizeDirection::Shrink
        };
        fs.target_size = Some(new_size);
        let format = device.common.format.clone();

        let serial = self.next_action_serial();
        self.actions.push(Action {
            serial,
            kind: ActionKind::Resize(direction),
            object: ObjectKind::Format,
            device: id,
            format,
            new_size: Some(new_size),
        });
        self.undo.insert(serial, Undo::SetMigration { device: id });
        Ok(serial)
    }

    /// Register a one-way filesystem migration (ext2 -> ext3 -> ext4).
    pub fn register_migrate_format(&mut self, id: DeviceId) -> Result<u64> {
        self.check_not_executing()?;
        self.check_not_protected(id)?;
        let device = self
            .devices
            .get_mut(&id)
            .ok_or_else(|| StorageError::DeviceTree(format!("device {id} not in tree")))?;
        let fs = device
            .common
            .format
            .as_mut()
            .and_then(|f| f.as_fs_mut())
            .ok_or_else(|| {
                StorageError::DeviceAction(format!("device {id} has no filesystem to migrate"))
            })?;
        let target = fs.fs_type.migration_target().ok_or_else(|| {
            StorageError::FsMigrate {
                device: id.to_string(),
                detail: format!("no migration path from {}", fs.fs_type.as_str()),
            }
        })?;
        fs.migrate_to = Some(target);
        let format = device.common.format.clone();

        let serial = self.next_action_serial();
        self.actions.push(Action {
            serial,
            kind: ActionKind::Migrate,
            object: ObjectKind::Format,
            device: id,
            format,
            new_size: None,
        });
        self.undo.insert(serial, Undo::SetMigration { device: id });
        Ok(serial)
    }

    /// Reverse the tree mutation a registration made and drop the action
    /// from the queue.
    pub fn cancel_action(&mut self, serial: u64) -> Result<()> {
        self.check_not_executing()?;
        let position = self
            .actions
            .iter()
            .position(|a| a.serial == serial)
            .ok_or_else(|| {
                StorageError::DeviceAction(format!("no pending action with serial {serial}"))
            })?;
        let undo = self.undo.remove(&serial).ok_or_else(|| {
            StorageError::DeviceAction(format!("action {serial} has no undo record"))
        })?;

        match undo {
            Undo::AddedDevice(id) => {
                self.remove_device(id)?;
            }
            Undo::RemovedDevice(device) => {
                self.add_device(device);
            }
            Undo::ReplacedDevice { added, displaced } => {
                self.remove_device(added)?;
                self.add_device(displaced);
            }
            Undo::ReplacedFormat { device, old } => {
                if let Some(d) = self.devices.get_mut(&device) {
                    d.common.format = old;
                }
            }
            Undo::RemovedFormat { device, old } => {
                if let Some(d) = self.devices.get_mut(&device) {
                    d.common.format = Some(old);
                }
            }
            Undo::SetTargetSize { device, old } => {
                if let Some(d) = self.devices.get_mut(&device) {
                    d.common.target_size = old;
                }
            }
            Undo::SetMigration { device } => {
                if let Some(fs) = self
                    .devices
                    .get_mut(&device)
                    .and_then(|d| d.common.format.as_mut())
                    .and_then(|f| f.as_fs_mut())
                {
                    fs.migrate_to = None;
                    fs.target_size = None;
                }
            }
        }

        self.actions.remove(position);
        Ok(())
    }

    /// Resolve a symbolic device spec to a tree device.
    ///
    /// Precedence: UUID=/LABEL= indices, direct path, blkid-tab uuid
    /// correlation, crypttab mapper names, `/dev/<vg>/<lv>` shorthand.
    pub fn resolve_device(&self, spec: &str) -> Option<&Device> {
        if let Some(uuid) = spec.strip_prefix("UUID=") {
            return self.get_by_uuid(uuid);
        }
        if let Some(label) = spec.strip_prefix("LABEL=") {
            return self.get_by_label(label);
        }
        if !spec.starts_with("/dev/") {
            return None;
        }

        if let Some(device) = self.get_by_path(spec) {
            return Some(device);
        }

        // A stale path may still be correlated through its blkid uuid.
        if let Some(uuid) = self.blkid_tab.get(spec) {
            if let Some(device) = self.get_by_uuid(uuid) {
                return Some(device);
            }
        }

        if let Some(map_name) = spec.strip_prefix("/dev/mapper/") {
            if let Some(backing) = self.crypt_tab.get(map_name) {
                let backing = self.get_by_path(backing)?;
                // The mapped device is the LUKS child of the backing one.
                return self
                    .children_of(backing.id)
                    .into_iter()
                    .filter_map(|id| self.get(id))
                    .find(|d| matches!(d.kind, DeviceExt::Luks(_)))
                    .or(Some(backing));
            }
        }

        // /dev/vg0/root is shorthand for /dev/mapper/vg0-root.
        let rest = spec.trim_start_matches("/dev/");
        if let Some((vg, lv)) = rest.split_once('/') {
            return self.get_by_name(&format!("{vg}-{lv}"));
        }

        None
    }

    /// The fstab spec a device should be referred to by: filesystem UUID
    /// when present, otherwise its path.
    pub fn fstab_spec(&self, id: DeviceId) -> Option<String> {
        let device = self.get(id)?;
        match device.format().and_then(|f| f.common.uuid.as_deref()) {
            Some(uuid) => Some(format!("UUID={uuid}")),
            None => Some(device.path()),
        }
    }
}
