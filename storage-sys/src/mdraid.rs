// SPDX-License-Identifier: GPL-3.0-only

//! mdadm adapter

use storage_types::{get_raid_min_members, RaidLevel};

use crate::run::Runner;
use crate::{Result, SysError};

/// One array as reported by `mdadm --examine --scan`.
#[derive(Debug, Clone, PartialEq)]
pub struct MdScanEntry {
    pub device: String,
    pub uuid: Option<String>,
    pub level: Option<String>,
    pub metadata: Option<String>,
    pub container: Option<String>,
    pub num_devices: Option<u32>,
}

pub fn parse_examine_scan(output: &str) -> Vec<MdScanEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if !line.starts_with("ARRAY ") {
                return None;
            }
            let mut parts = line.split_whitespace();
            let _array = parts.next()?;
            let device = parts.next()?.to_string();

            let mut entry = MdScanEntry {
                device,
                uuid: None,
                level: None,
                metadata: None,
                container: None,
                num_devices: None,
            };
            for token in parts {
                if let Some(value) = token.strip_prefix("UUID=") {
                    entry.uuid = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("level=") {
                    entry.level = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("metadata=") {
                    entry.metadata = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("container=") {
                    entry.container = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("num-devices=") {
                    entry.num_devices = value.parse().ok();
                }
            }
            Some(entry)
        })
        .collect()
}

/// Key/value pairs from `mdadm --detail <device>` ("Raid Level : raid1").
pub fn parse_detail(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(" : ")?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn examine_scan(runner: &dyn Runner) -> Result<Vec<MdScanEntry>> {
    let output = runner.run("mdadm", &["--examine", "--scan"])?;
    Ok(parse_examine_scan(&output.stdout))
}

/// Create an array. Member count is validated against the level before
/// mdadm ever runs.
pub fn create(
    runner: &dyn Runner,
    device: &str,
    level: RaidLevel,
    members: &[&str],
    spares: usize,
    bitmap: bool,
) -> Result<()> {
    let active = members.len().saturating_sub(spares);
    if active < get_raid_min_members(level) {
        return Err(SysError::OperationFailed(format!(
            "{} requires at least {} members, got {}",
            level,
            get_raid_min_members(level),
            active
        )));
    }

    let level_arg = format!("--level={}", level.as_str());
    let devices_arg = format!("--raid-devices={active}");
    let spares_arg = format!("--spare-devices={spares}");
    let mut args = vec![
        "--create",
        device,
        "--run",
        level_arg.as_str(),
        devices_arg.as_str(),
        spares_arg.as_str(),
    ];
    if bitmap {
        args.push("--bitmap=internal");
    }
    args.extend_from_slice(members);
    runner.run("mdadm", &args).map(|_| ())
}

/// Assemble a preexisting array from explicitly named members; the config
/// file is never consulted during probe.
pub fn activate(runner: &dyn Runner, device: &str, uuid: &str, members: &[&str]) -> Result<()> {
    let uuid_arg = format!("--uuid={uuid}");
    let mut args = vec!["--assemble", device, uuid_arg.as_str(), "--run"];
    args.extend_from_slice(members);
    runner.run("mdadm", &args).map(|_| ())
}

pub fn deactivate(runner: &dyn Runner, device: &str) -> Result<()> {
    runner.run("mdadm", &["--stop", device]).map(|_| ())
}

/// Wipe the member superblock; this is the destroy step for an
/// mdmember format.
pub fn destroy_member(runner: &dyn Runner, member: &str) -> Result<()> {
    runner
        .run("mdadm", &["--zero-superblock", member])
        .map(|_| ())
}

pub fn add_member(runner: &dyn Runner, device: &str, member: &str) -> Result<()> {
    runner.run("mdadm", &["--add", device, member]).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ScriptedRunner;

    #[test]
    fn parses_examine_scan_entries() {
        let entries = parse_examine_scan(
            "ARRAY /dev/md0 level=raid1 num-devices=2 metadata=1.2 UUID=aa:bb:cc:dd\nARRAY /dev/md/imsm metadata=imsm UUID=11:22\nARRAY /dev/md/vol0 container=/dev/md/imsm member=0 UUID=33:44\n",
        );
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].level.as_deref(), Some("raid1"));
        assert_eq!(entries[0].num_devices, Some(2));
        assert_eq!(entries[1].metadata.as_deref(), Some("imsm"));
        assert_eq!(entries[2].container.as_deref(), Some("/dev/md/imsm"));
    }

    #[test]
    fn parses_detail_pairs() {
        let pairs = parse_detail("        Raid Level : raid5\n        Chunk Size : 512K\n");
        assert!(pairs.contains(&("Raid Level".to_string(), "raid5".to_string())));
    }

    #[test]
    fn create_validates_member_count() {
        let runner = ScriptedRunner::new();
        let err = create(
            &runner,
            "/dev/md0",
            RaidLevel::Raid5,
            &["/dev/sda1", "/dev/sdb1"],
            0,
            false,
        );
        assert!(err.is_err());
        assert!(runner.calls().is_empty(), "mdadm must not run");

        create(
            &runner,
            "/dev/md0",
            RaidLevel::Raid5,
            &["/dev/sda1", "/dev/sdb1", "/dev/sdc1"],
            0,
            true,
        )
        .unwrap();
        assert!(runner.saw(
            "mdadm",
            &["--create", "/dev/md0", "--level=raid5", "--bitmap=internal"]
        ));
    }

    #[test]
    fn activate_names_members_explicitly() {
        let runner = ScriptedRunner::new();
        activate(&runner, "/dev/md0", "aa:bb", &["/dev/sda1", "/dev/sdb1"]).unwrap();
        assert!(runner.saw("mdadm", &["--assemble", "--uuid=aa:bb", "/dev/sdb1"]));
    }
}
