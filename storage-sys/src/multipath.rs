// SPDX-License-Identifier: GPL-3.0-only

//! Multipath discovery and control
//!
//! Member detection cannot rely on `DM_*` properties because it must run
//! before any mpath map exists. Paths are grouped by `ID_SERIAL_SHORT`:
//! two disks with the same serial are two paths to one LUN, except behind
//! usb-storage, where card readers expose identical serials for genuinely
//! distinct LUNs.

use std::collections::BTreeMap;

use crate::run::Runner;
use crate::udev::UdevInfo;
use crate::Result;

/// The tripartition of an enumeration pass.
#[derive(Debug, Default, Clone)]
pub struct MultipathTopology {
    /// Plain disks with a unique serial (or collapsed false positives).
    pub singles: Vec<UdevInfo>,
    /// Path groups; each inner vec holds every path to one LUN.
    pub groups: Vec<Vec<UdevInfo>>,
    /// Partitions, passed through untouched for later classification.
    pub partitions: Vec<UdevInfo>,
}

fn is_usb_storage(info: &UdevInfo) -> bool {
    info.usb_driver.as_deref() == Some("usb-storage")
}

/// Split an enumeration into singles, multipath groups and partitions.
pub fn identify_multipaths(devices: &[UdevInfo]) -> MultipathTopology {
    let mut topology = MultipathTopology::default();
    let mut by_serial: BTreeMap<String, Vec<UdevInfo>> = BTreeMap::new();

    for info in devices {
        if info.is_partition() {
            topology.partitions.push(info.clone());
            continue;
        }
        if info.is_dm() || info.is_md() || info.is_cdrom() {
            // Composite or optical devices are never multipath members.
            topology.singles.push(info.clone());
            continue;
        }
        match info.serial_short.as_deref().or(info.serial.as_deref()) {
            Some(serial) if !serial.is_empty() => by_serial
                .entry(serial.to_string())
                .or_default()
                .push(info.clone()),
            _ => topology.singles.push(info.clone()),
        }
    }

    for (_serial, mut paths) in by_serial {
        if paths.len() < 2 || paths.iter().any(is_usb_storage) {
            // Card-reader LUNs share a serial but are independent disks.
            topology.singles.append(&mut paths);
        } else {
            topology.groups.push(paths);
        }
    }

    topology
}

/// Default name for the nth mpath map, mirroring the tool's own scheme.
pub fn mpath_name(index: usize) -> String {
    // mpatha, mpathb, ... mpathz, mpathaa, ...
    let mut name = String::from("mpath");
    let mut n = index;
    let mut suffix = Vec::new();
    loop {
        suffix.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    suffix.reverse();
    name.push_str(std::str::from_utf8(&suffix).unwrap_or("a"));
    name
}

/// Assemble every configured multipath map.
pub fn assemble(runner: &dyn Runner) -> Result<()> {
    runner.run("multipath", &[]).map(|_| ())
}

/// Flush one map, releasing its paths.
pub fn flush(runner: &dyn Runner, name: &str) -> Result<()> {
    runner.run("multipath", &["-f", name]).map(|_| ())
}

/// Re-read partition tables on a map's paths.
pub fn kpartx_update(runner: &dyn Runner, device: &str) -> Result<()> {
    runner.run("kpartx", &["-a", "-p", "p", device]).map(|_| ())
}
