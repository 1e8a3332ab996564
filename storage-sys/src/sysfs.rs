// SPDX-License-Identifier: GPL-3.0-only

//! Sysfs block-tree readers

use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

const SYS_BLOCK_DIR: &str = "/sys/class/block";

pub fn sysfs_path(name: &str) -> PathBuf {
    Path::new(SYS_BLOCK_DIR).join(name)
}

/// Device size in 512-byte sectors; the `size` attribute is always in
/// 512-byte units regardless of the device's logical sector size.
pub fn size_sectors(sysfs: &Path) -> Result<u64> {
    let raw = fs::read_to_string(sysfs.join("size"))?;
    Ok(raw.trim().parse().unwrap_or(0))
}

/// Names of the devices this one is stacked on (md members, dm tables,
/// partition's disk).
pub fn slaves(sysfs: &Path) -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(sysfs.join("slaves")) {
        for entry in entries.flatten() {
            out.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    out.sort();
    out
}

/// Names of devices stacked on top of this one.
pub fn holders(sysfs: &Path) -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(sysfs.join("holders")) {
        for entry in entries.flatten() {
            out.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    out.sort();
    out
}

/// For a partition entry, the kernel name of its disk (the parent
/// directory in the /sys/block hierarchy).
pub fn partition_disk(sysfs: &Path) -> Option<String> {
    let resolved = fs::canonicalize(sysfs).ok()?;
    resolved
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| n != "block")
}

/// Partition number from the sysfs `partition` attribute.
pub fn partition_number(sysfs: &Path) -> Option<u32> {
    let raw = fs::read_to_string(sysfs.join("partition")).ok()?;
    raw.trim().parse().ok()
}

/// `md/array_state`: "clear", "inactive", "clean", "active", ...
pub fn md_array_state(sysfs: &Path) -> Option<String> {
    let raw = fs::read_to_string(sysfs.join("md/array_state")).ok()?;
    Some(raw.trim().to_string())
}

pub fn md_degraded(sysfs: &Path) -> bool {
    fs::read_to_string(sysfs.join("md/degraded"))
        .map(|raw| raw.trim() == "1")
        .unwrap_or(false)
}

/// DASD online status from `device/status` ("online", "offline", ...).
pub fn dasd_status(sysfs: &Path) -> Option<String> {
    let raw = fs::read_to_string(sysfs.join("device/status")).ok()?;
    Some(raw.trim().to_string())
}

/// Whether the device is removable media per sysfs.
pub fn is_removable(sysfs: &Path) -> bool {
    fs::read_to_string(sysfs.join("removable"))
        .map(|raw| raw.trim() == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fixture_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("sda");
        fs::create_dir_all(dev.join("slaves")).unwrap();
        fs::create_dir_all(dev.join("md")).unwrap();
        fs::write(dev.join("size"), "20480000\n").unwrap();
        fs::write(dev.join("md/array_state"), "clean\n").unwrap();
        fs::write(dev.join("md/degraded"), "0\n").unwrap();
        fs::write(dev.join("removable"), "0\n").unwrap();
        fs::create_dir_all(dev.join("slaves/sdb")).unwrap();
        fs::create_dir_all(dev.join("slaves/sdc")).unwrap();

        assert_eq!(size_sectors(&dev).unwrap(), 20480000);
        assert_eq!(md_array_state(&dev).as_deref(), Some("clean"));
        assert!(!md_degraded(&dev));
        assert!(!is_removable(&dev));
        assert_eq!(slaves(&dev), vec!["sdb", "sdc"]);
        assert!(holders(&dev).is_empty());
    }
}
