// SPDX-License-Identifier: GPL-3.0-only

//! Procfs parsers
//!
//! Line-by-line parsing of the handful of /proc files the engine consults.
//! Each parser takes the file content so tests feed literal samples.

use std::collections::HashMap;
use std::fs;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub options: String,
}

pub fn read_mounts() -> Result<Vec<MountEntry>> {
    Ok(parse_mounts(&fs::read_to_string("/proc/mounts")?))
}

pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                device: fields.next()?.to_string(),
                mountpoint: fields.next()?.to_string(),
                fs_type: fields.next()?.to_string(),
                options: fields.next().unwrap_or("").to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEntry {
    pub device: String,
    pub kind: String,
    pub size_kib: u64,
}

pub fn read_swaps() -> Result<Vec<SwapEntry>> {
    Ok(parse_swaps(&fs::read_to_string("/proc/swaps")?))
}

pub fn parse_swaps(content: &str) -> Vec<SwapEntry> {
    content
        .lines()
        .skip(1) // header
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(SwapEntry {
                device: fields.next()?.to_string(),
                kind: fields.next()?.to_string(),
                size_kib: fields.next()?.parse().ok()?,
            })
        })
        .collect()
}

/// Filesystems the running kernel supports; `nodev` types keep the flag.
pub fn parse_filesystems(content: &str) -> Vec<(String, bool)> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            if line.is_empty() {
                return None;
            }
            if let Some(rest) = line.strip_prefix("nodev") {
                Some((rest.trim().to_string(), true))
            } else {
                Some((line.trim().to_string(), false))
            }
        })
        .collect()
}

pub fn read_filesystems() -> Result<Vec<(String, bool)>> {
    Ok(parse_filesystems(&fs::read_to_string("/proc/filesystems")?))
}

/// Total memory in KiB from /proc/meminfo, used for default swap sizing.
pub fn parse_mem_total_kib(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        rest.trim().split_whitespace().next()?.parse().ok()
    })
}

pub fn read_mem_total_kib() -> Result<Option<u64>> {
    Ok(parse_mem_total_kib(&fs::read_to_string("/proc/meminfo")?))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdstatArray {
    pub name: String,
    pub active: bool,
    pub level: Option<String>,
    /// Member names with their slot brackets stripped.
    pub members: Vec<String>,
    pub degraded: bool,
}

pub fn read_mdstat() -> Result<HashMap<String, MdstatArray>> {
    Ok(parse_mdstat(&fs::read_to_string("/proc/mdstat")?))
}

pub fn parse_mdstat(content: &str) -> HashMap<String, MdstatArray> {
    let mut map = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("Personalities")
            || trimmed.starts_with("unused")
        {
            continue;
        }

        if !line.starts_with(' ') && trimmed.starts_with("md") {
            let mut parts = trimmed.split_whitespace();
            let Some(name) = parts.next() else { continue };
            let _colon = parts.next();
            let active = parts.clone().any(|p| p == "active");
            let level = parts
                .clone()
                .find(|p| p.starts_with("raid") || *p == "linear" || *p == "multipath")
                .map(str::to_string);
            let members = parts
                .filter(|p| p.contains('[') && p.contains(']'))
                .map(|p| p.split('[').next().unwrap_or(p).to_string())
                .collect();
            map.insert(
                name.to_string(),
                MdstatArray {
                    name: name.to_string(),
                    active,
                    level,
                    members,
                    degraded: false,
                },
            );
            current = Some(name.to_string());
            continue;
        }

        // Status line: "976630336 blocks [2/2] [UU]"; an underscore in
        // the slot map means a missing member.
        if let Some(name) = current.as_ref() {
            if trimmed.contains('[') && trimmed.contains('/') {
                if let Some(state) = map.get_mut(name) {
                    state.degraded = trimmed
                        .rsplit('[')
                        .next()
                        .map(|s| s.contains('_'))
                        .unwrap_or(false);
                }
            }
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mounts() {
        let mounts = parse_mounts(
            "/dev/sda2 / ext4 rw,relatime 0 0\nproc /proc proc rw 0 0\n/dev/mapper/vg0-home /home ext4 rw 0 0\n",
        );
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].device, "/dev/sda2");
        assert_eq!(mounts[2].mountpoint, "/home");
        assert_eq!(mounts[2].fs_type, "ext4");
    }

    #[test]
    fn parses_swaps_skipping_header() {
        let swaps = parse_swaps(
            "Filename\t\t\t\tType\t\tSize\tUsed\tPriority\n/dev/sda3                               partition\t2097148\t0\t-2\n",
        );
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0].device, "/dev/sda3");
        assert_eq!(swaps[0].kind, "partition");
        assert_eq!(swaps[0].size_kib, 2097148);
    }

    #[test]
    fn parses_filesystems_nodev_flag() {
        let list = parse_filesystems("nodev\tsysfs\nnodev\ttmpfs\n\text4\n\txfs\n");
        assert!(list.contains(&("sysfs".to_string(), true)));
        assert!(list.contains(&("ext4".to_string(), false)));
    }

    #[test]
    fn parses_meminfo_total() {
        assert_eq!(
            parse_mem_total_kib("MemTotal:       16314268 kB\nMemFree: 100 kB\n"),
            Some(16314268)
        );
    }

    #[test]
    fn parses_mdstat_members_and_degraded() {
        let sample = "\
Personalities : [raid1] [raid6] [raid5] [raid4]
md0 : active raid1 sdb1[1] sda1[0]
      976630336 blocks super 1.2 [2/2] [UU]
md1 : active raid5 sdd1[3] sdc1[1] sde1[0]
      1953260544 blocks super 1.2 level 5, 512k chunk [3/2] [U_U]
unused devices: <none>
";
        let arrays = parse_mdstat(sample);
        let md0 = arrays.get("md0").unwrap();
        assert!(md0.active);
        assert_eq!(md0.level.as_deref(), Some("raid1"));
        assert_eq!(md0.members, vec!["sdb1", "sda1"]);
        assert!(!md0.degraded);

        let md1 = arrays.get("md1").unwrap();
        assert!(md1.degraded);
        assert_eq!(md1.members.len(), 3);
    }
}
