// SPDX-License-Identifier: GPL-3.0-only

//! Udev database access
//!
//! Reads the kernel udev db entries directly (`/run/udev/data/b<maj>:<min>`)
//! rather than going through a daemon: probe runs before any session bus or
//! udisks is available in the installer environment. Entries are
//! line-oriented: `N:<name>`, `S:<symlink>`, `E:<KEY>=<VAL>`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::run::Runner;
use crate::{Result, SysError};

const UDEV_DATA_DIR: &str = "/run/udev/data";
const SYS_BLOCK_DIR: &str = "/sys/class/block";

/// Models probe refuses to touch. Virtual floppy/cd emulation LUNs on
/// BMCs show up as disks and wedge when read.
const MODEL_DENYLIST: &[&str] = &["Virtual Floppy", "Virtual HDisk", "SA FLOPPY"];

/// Every udev property the engine consumes, parsed once into a struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdevInfo {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub symlinks: Vec<String>,
    pub devtype: Option<String>,

    pub fs_type: Option<String>,
    pub fs_uuid: Option<String>,
    pub fs_label: Option<String>,

    pub serial: Option<String>,
    pub serial_short: Option<String>,
    pub id_path: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub bus: Option<String>,
    pub wwn: Option<String>,
    pub usb_driver: Option<String>,

    pub dm_name: Option<String>,
    pub dm_uuid: Option<String>,

    pub md_uuid: Option<String>,
    pub md_level: Option<String>,
    pub md_devices: Option<u32>,
    pub md_metadata: Option<String>,
    pub md_container: Option<String>,

    pub lvm_vg_name: Option<String>,
    pub lvm_vg_uuid: Option<String>,
    pub lvm_lv_name: Option<String>,

    /// Remaining E: keys nothing consumes by name.
    pub extra: BTreeMap<String, String>,
}

impl UdevInfo {
    pub fn is_dm(&self) -> bool {
        self.dm_name.is_some() || self.name.starts_with("dm-")
    }

    pub fn is_md(&self) -> bool {
        self.md_uuid.is_some() || self.md_level.is_some()
    }

    pub fn is_partition(&self) -> bool {
        self.devtype.as_deref() == Some("partition")
    }

    pub fn is_cdrom(&self) -> bool {
        self.name.starts_with("sr") || self.extra.contains_key("ID_CDROM")
    }

    pub fn is_multipath_map(&self) -> bool {
        self.dm_uuid
            .as_deref()
            .map(|uuid| uuid.starts_with("mpath-"))
            .unwrap_or(false)
    }

    pub fn is_crypt_map(&self) -> bool {
        self.dm_uuid
            .as_deref()
            .map(|uuid| uuid.starts_with("CRYPT-LUKS"))
            .unwrap_or(false)
    }

    pub fn is_lvm_map(&self) -> bool {
        self.lvm_vg_name.is_some()
            || self
                .dm_uuid
                .as_deref()
                .map(|uuid| uuid.starts_with("LVM-"))
                .unwrap_or(false)
    }
}

/// Parse one udev db entry. Unknown line prefixes are skipped; udev adds
/// them over time (G:, Q:, V:) and none of them matter here.
pub fn parse_udev_entry(name: &str, major: u32, minor: u32, content: &str) -> UdevInfo {
    let mut info = UdevInfo {
        name: name.to_string(),
        major,
        minor,
        ..UdevInfo::default()
    };

    for line in content.lines() {
        let Some((prefix, rest)) = line.split_once(':') else {
            continue;
        };
        match prefix {
            "N" => info.name = rest.to_string(),
            "S" => info.symlinks.push(format!("/dev/{rest}")),
            "E" => {
                let Some((key, value)) = rest.split_once('=') else {
                    continue;
                };
                apply_property(&mut info, key, value);
            }
            _ => {}
        }
    }

    info
}

fn apply_property(info: &mut UdevInfo, key: &str, value: &str) {
    let value_owned = || Some(value.to_string());
    match key {
        "DEVTYPE" => info.devtype = value_owned(),
        "ID_FS_TYPE" => info.fs_type = value_owned(),
        "ID_FS_UUID" => info.fs_uuid = value_owned(),
        "ID_FS_LABEL" => info.fs_label = value_owned(),
        "ID_SERIAL" => info.serial = value_owned(),
        "ID_SERIAL_SHORT" => info.serial_short = value_owned(),
        "ID_PATH" => info.id_path = value_owned(),
        "ID_VENDOR" => info.vendor = value_owned(),
        "ID_MODEL" => info.model = value_owned(),
        "ID_BUS" => info.bus = value_owned(),
        "ID_WWN" => info.wwn = value_owned(),
        "ID_USB_DRIVER" => info.usb_driver = value_owned(),
        "DM_NAME" => info.dm_name = value_owned(),
        "DM_UUID" => info.dm_uuid = value_owned(),
        "MD_UUID" => info.md_uuid = value_owned(),
        "MD_LEVEL" => info.md_level = value_owned(),
        "MD_DEVICES" => info.md_devices = value.parse().ok(),
        "MD_METADATA" => info.md_metadata = value_owned(),
        "MD_CONTAINER" => info.md_container = value_owned(),
        "LVM2_VG_NAME" => info.lvm_vg_name = value_owned(),
        "LVM2_VG_UUID" => info.lvm_vg_uuid = value_owned(),
        "LVM2_LV_NAME" => info.lvm_lv_name = value_owned(),
        _ => {
            info.extra.insert(key.to_string(), value.to_string());
        }
    }
}

fn read_majmin(sys_entry: &Path) -> Result<(u32, u32)> {
    let dev = fs::read_to_string(sys_entry.join("dev"))?;
    let dev = dev.trim();
    let (major, minor) = dev.split_once(':').ok_or_else(|| SysError::ParseFailed {
        source_name: "sysfs dev".to_string(),
        detail: format!("malformed major:minor {dev:?}"),
    })?;
    Ok((
        major.parse().map_err(|_| SysError::ParseFailed {
            source_name: "sysfs dev".to_string(),
            detail: format!("bad major in {dev:?}"),
        })?,
        minor.parse().map_err(|_| SysError::ParseFailed {
            source_name: "sysfs dev".to_string(),
            detail: format!("bad minor in {dev:?}"),
        })?,
    ))
}

/// Load udev info for one block device by kernel name.
pub fn get_device_info(name: &str) -> Result<UdevInfo> {
    get_device_info_at(Path::new(SYS_BLOCK_DIR), Path::new(UDEV_DATA_DIR), name)
}

pub fn get_device_info_at(sys_block: &Path, udev_data: &Path, name: &str) -> Result<UdevInfo> {
    let sys_entry = sys_block.join(name);
    if !sys_entry.exists() {
        return Err(SysError::DeviceNotFound(name.to_string()));
    }
    let (major, minor) = read_majmin(&sys_entry)?;
    let db = udev_data.join(format!("b{major}:{minor}"));
    let content = fs::read_to_string(&db).unwrap_or_default();
    Ok(parse_udev_entry(name, major, minor, &content))
}

fn name_is_filtered(name: &str) -> bool {
    name.starts_with("loop") || name.starts_with("ram") || name.starts_with("fd")
}

fn model_is_denylisted(info: &UdevInfo) -> bool {
    info.model
        .as_deref()
        .map(|model| MODEL_DENYLIST.iter().any(|bad| model.contains(bad)))
        .unwrap_or(false)
}

/// Enumerate block devices, filtering loop/ram/floppy names and denylisted
/// models. Devices whose info cannot be read are logged and skipped; probe
/// failure is never fatal per device.
pub fn enumerate_block_devices() -> Result<Vec<UdevInfo>> {
    enumerate_block_devices_at(Path::new(SYS_BLOCK_DIR), Path::new(UDEV_DATA_DIR))
}

pub fn enumerate_block_devices_at(sys_block: &Path, udev_data: &Path) -> Result<Vec<UdevInfo>> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(sys_block)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name_is_filtered(&name) {
            names.push(name);
        }
    }
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        match get_device_info_at(sys_block, udev_data, &name) {
            Ok(info) => {
                if model_is_denylisted(&info) {
                    tracing::debug!(name, "skipping denylisted model");
                    continue;
                }
                devices.push(info);
            }
            Err(err) => {
                tracing::warn!(name, %err, "skipping unreadable block device");
            }
        }
    }
    Ok(devices)
}

/// Wait for the udev event queue to drain. The 30 second timeout is
/// udevadm's own default; a timeout is not an error for callers.
pub fn settle(runner: &dyn Runner) -> Result<()> {
    runner.run("udevadm", &["settle", "--timeout=30"]).map(|_| ())
}

/// Ask the kernel to re-emit a change event for a device.
pub fn trigger_change(sysfs_path: &str) -> Result<()> {
    let uevent = PathBuf::from(sysfs_path).join("uevent");
    fs::write(uevent, "change\n")?;
    Ok(())
}
