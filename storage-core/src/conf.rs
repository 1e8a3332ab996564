// SPDX-License-Identifier: GPL-3.0-only

//! Persistent configuration files
//!
//! Writers and parsers for the config files the installed system needs to
//! reassemble its storage at boot: `/etc/mdadm.conf`, `/etc/multipath.conf`
//! and `/etc/dasd.conf`. Each writer renders from the device tree and each
//! parser reads the rendered form back, so a written file round-trips to an
//! equivalent record set.

use storage_sys::mdraid::{self, MdScanEntry};
use storage_types::{DeviceExt, DiskVariant, MdKind};

use crate::error::{Result, StorageError};
use crate::tree::DeviceTree;

/// One `ARRAY` record. Containers and arrays inside containers carry only
/// a UUID; plain arrays also record their level and member count so mdadm
/// can refuse a partial assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdadmArray {
    pub device: String,
    pub uuid: String,
    pub level: Option<String>,
    pub num_devices: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdadmConf {
    pub arrays: Vec<MdadmArray>,
}

impl MdadmConf {
    pub fn from_tree(tree: &DeviceTree) -> Self {
        let mut arrays = Vec::new();
        for device in tree.devices() {
            let DeviceExt::MdArray(ext) = &device.kind else {
                continue;
            };
            let Some(uuid) = ext.uuid.clone() else {
                continue;
            };
            let (level, num_devices) = match ext.kind {
                MdKind::Container | MdKind::BiosRaidArray => (None, None),
                MdKind::Array => (
                    Some(ext.level.as_str().to_string()),
                    Some(ext.member_count),
                ),
            };
            arrays.push(MdadmArray {
                device: device.path(),
                uuid,
                level,
                num_devices,
            });
        }
        MdadmConf { arrays }
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# mdadm.conf written out by the installer\nMAILADDR root\n");
        for array in &self.arrays {
            out.push_str(&format!("ARRAY {}", array.device));
            if let Some(level) = &array.level {
                out.push_str(&format!(" level={level}"));
            }
            if let Some(n) = array.num_devices {
                out.push_str(&format!(" num-devices={n}"));
            }
            out.push_str(&format!(" UUID={}\n", array.uuid));
        }
        out
    }

    pub fn parse(text: &str) -> Self {
        let arrays = mdraid::parse_examine_scan(text)
            .into_iter()
            .filter_map(|entry: MdScanEntry| {
                Some(MdadmArray {
                    device: entry.device,
                    uuid: entry.uuid?,
                    level: entry.level,
                    num_devices: entry.num_devices,
                })
            })
            .collect();
        MdadmConf { arrays }
    }
}

/// Device node patterns multipath must never claim.
const BLACKLISTED_DEVNODES: &[&str] = &[
    "^(ram|raw|ctl|loop|fd|md|dm-|sr|scd|st)[0-9]*",
    "^hd[a-z]",
    "^dcssblk[0-9]*",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipathConf {
    pub friendly_names: bool,
    pub blacklist_devnodes: Vec<String>,
    /// Individual paths excluded by world-wide id.
    pub blacklist_wwids: Vec<String>,
    /// Whole hardware families excluded by vendor/product pair.
    pub blacklist_devices: Vec<(String, String)>,
    /// (wwid, alias) for every mpath the tree models.
    pub multipaths: Vec<(String, String)>,
}

impl Default for MultipathConf {
    fn default() -> Self {
        MultipathConf {
            friendly_names: true,
            blacklist_devnodes: BLACKLISTED_DEVNODES.iter().map(|s| s.to_string()).collect(),
            blacklist_wwids: Vec::new(),
            blacklist_devices: Vec::new(),
            multipaths: Vec::new(),
        }
    }
}

impl MultipathConf {
    /// Defaults plus one `multipath` stanza per mpath device in the tree.
    pub fn from_tree(tree: &DeviceTree) -> Self {
        let mut conf = MultipathConf::default();
        for device in tree.devices() {
            if let DeviceExt::Multipath(ext) = &device.kind {
                conf.multipaths
                    .push((ext.wwid.clone(), device.name().to_string()));
            }
        }
        conf
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# multipath.conf written out by the installer\n");
        out.push_str("defaults {\n");
        out.push_str(&format!(
            "\tuser_friendly_names {}\n",
            if self.friendly_names { "yes" } else { "no" }
        ));
        out.push_str("}\n");

        out.push_str("blacklist {\n");
        for devnode in &self.blacklist_devnodes {
            out.push_str(&format!("\tdevnode \"{devnode}\"\n"));
        }
        for wwid in &self.blacklist_wwids {
            out.push_str(&format!("\twwid \"{wwid}\"\n"));
        }
        for (vendor, product) in &self.blacklist_devices {
            out.push_str("\tdevice {\n");
            out.push_str(&format!("\t\tvendor \"{vendor}\"\n"));
            out.push_str(&format!("\t\tproduct \"{product}\"\n"));
            out.push_str("\t}\n");
        }
        out.push_str("}\n");

        if !self.multipaths.is_empty() {
            out.push_str("multipaths {\n");
            for (wwid, alias) in &self.multipaths {
                out.push_str("\tmultipath {\n");
                out.push_str(&format!("\t\twwid \"{wwid}\"\n"));
                out.push_str(&format!("\t\talias {alias}\n"));
                out.push_str("\t}\n");
            }
            out.push_str("}\n");
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut conf = MultipathConf {
            blacklist_devnodes: Vec::new(),
            ..MultipathConf::default()
        };
        // Section stack: brace nesting tells us where a keyword belongs.
        let mut stack: Vec<String> = Vec::new();
        let mut vendor: Option<String> = None;
        let mut wwid: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_suffix('{') {
                stack.push(section.trim().to_string());
                continue;
            }
            if line == "}" {
                let closed = stack.pop().ok_or_else(|| {
                    StorageError::Parse("unbalanced braces in multipath.conf".to_string())
                })?;
                // A stanza may end before naming an alias.
                if closed == "multipath" {
                    if let Some(w) = wwid.take() {
                        conf.multipaths.push((w, String::new()));
                    }
                }
                continue;
            }

            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match (stack.last().map(String::as_str), key) {
                (Some("defaults"), "user_friendly_names") => {
                    conf.friendly_names = value == "yes";
                }
                (Some("blacklist"), "devnode") => conf.blacklist_devnodes.push(value),
                (Some("blacklist"), "wwid") => conf.blacklist_wwids.push(value),
                (Some("device"), "vendor") => vendor = Some(value),
                (Some("device"), "product") => {
                    if let Some(vendor) = vendor.take() {
                        conf.blacklist_devices.push((vendor, value));
                    }
                }
                (Some("multipath"), "wwid") => wwid = Some(value),
                (Some("multipath"), "alias") => {
                    if let Some(wwid) = wwid.take() {
                        conf.multipaths.push((wwid, value));
                    }
                }
                _ => {}
            }
        }
        if !stack.is_empty() {
            return Err(StorageError::Parse(
                "unbalanced braces in multipath.conf".to_string(),
            ));
        }
        Ok(conf)
    }
}

/// One configured DASD: bus id plus its sysfs options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DasdEntry {
    pub bus_id: String,
    pub opts: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DasdConf {
    pub entries: Vec<DasdEntry>,
}

impl DasdConf {
    pub fn from_tree(tree: &DeviceTree) -> Self {
        let mut entries = Vec::new();
        for device in tree.devices() {
            if let DeviceExt::Disk(ext) = &device.kind {
                if let DiskVariant::Dasd { bus_id, opts } = &ext.variant {
                    entries.push(DasdEntry {
                        bus_id: bus_id.clone(),
                        opts: opts.clone(),
                    });
                }
            }
        }
        DasdConf { entries }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.bus_id);
            for (key, value) in &entry.opts {
                out.push_str(&format!(" {key}={value}"));
            }
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let mut tokens = line.split_whitespace();
                let bus_id = tokens.next()?.to_string();
                let opts = tokens
                    .filter_map(|t| {
                        t.split_once('=')
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                    })
                    .collect();
                Some(DasdEntry { bus_id, opts })
            })
            .collect();
        DasdConf { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::{Device, DiskExt, MdExt, MultipathExt, RaidLevel};

    use crate::config::StorageConfig;

    #[test]
    fn mdadm_conf_round_trips() {
        let mut tree = DeviceTree::new(StorageConfig::default());
        let mut md = Device::new(
            tree.next_device_id(),
            "md0",
            DeviceExt::MdArray(MdExt {
                level: RaidLevel::Raid1,
                member_count: 2,
                uuid: Some("11111111:22222222:33333333:44444444".to_string()),
                ..MdExt::default()
            }),
        );
        md.common.exists = true;
        tree.add_device(md);

        let mut container = Device::new(
            tree.next_device_id(),
            "md127",
            DeviceExt::MdArray(MdExt {
                kind: MdKind::Container,
                uuid: Some("aaaaaaaa:bbbbbbbb:cccccccc:dddddddd".to_string()),
                ..MdExt::default()
            }),
        );
        container.common.exists = true;
        tree.add_device(container);

        let conf = MdadmConf::from_tree(&tree);
        let text = conf.render();
        assert!(text.contains("ARRAY /dev/md0 level=raid1 num-devices=2 UUID=11111111"));
        // Container entries carry the UUID alone.
        assert!(text.contains("ARRAY /dev/md127 UUID=aaaaaaaa"));
        assert!(!text.contains("md127 level="));

        assert_eq!(MdadmConf::parse(&text), conf);
    }

    #[test]
    fn arrays_without_uuid_are_not_written() {
        let mut tree = DeviceTree::new(StorageConfig::default());
        let md = Device::new(
            tree.next_device_id(),
            "md0",
            DeviceExt::MdArray(MdExt::default()),
        );
        tree.add_device(md);
        assert!(MdadmConf::from_tree(&tree).arrays.is_empty());
    }

    #[test]
    fn multipath_conf_round_trips() {
        let mut conf = MultipathConf::default();
        conf.blacklist_wwids.push("3600508b400105e210000900000490000".to_string());
        conf.blacklist_devices
            .push(("IBM".to_string(), "S/390 DASD".to_string()));
        conf.multipaths
            .push(("36005076303ffc56200000000000010aa".to_string(), "mpatha".to_string()));

        let text = conf.render();
        assert!(text.contains("user_friendly_names yes"));
        assert!(text.contains("wwid \"3600508b400105e210000900000490000\""));
        assert!(text.contains("alias mpatha"));

        assert_eq!(MultipathConf::parse(&text).unwrap(), conf);
    }

    #[test]
    fn multipath_stanzas_come_from_tree_devices() {
        let mut tree = DeviceTree::new(StorageConfig::default());
        let mut mpath = Device::new(
            tree.next_device_id(),
            "mpatha",
            DeviceExt::Multipath(MultipathExt {
                wwid: "36005076303ffc56200000000000010aa".to_string(),
            }),
        );
        mpath.common.exists = true;
        tree.add_device(mpath);

        let conf = MultipathConf::from_tree(&tree);
        assert_eq!(
            conf.multipaths,
            vec![(
                "36005076303ffc56200000000000010aa".to_string(),
                "mpatha".to_string()
            )]
        );
    }

    #[test]
    fn unbalanced_multipath_conf_is_rejected() {
        assert!(MultipathConf::parse("blacklist {\n\twwid \"x\"\n").is_err());
    }

    #[test]
    fn dasd_conf_round_trips() {
        let mut tree = DeviceTree::new(StorageConfig::default());
        let mut dasd = Device::new(
            tree.next_device_id(),
            "dasda",
            DeviceExt::Disk(DiskExt {
                variant: DiskVariant::Dasd {
                    bus_id: "0.0.0100".to_string(),
                    opts: vec![
                        ("use_diag".to_string(), "0".to_string()),
                        ("readonly".to_string(), "0".to_string()),
                    ],
                },
                unusable: false,
            }),
        );
        dasd.common.exists = true;
        tree.add_device(dasd);

        let conf = DasdConf::from_tree(&tree);
        let text = conf.render();
        assert_eq!(text, "0.0.0100 use_diag=0 readonly=0\n");
        assert_eq!(DasdConf::parse(&text), conf);
    }
}
