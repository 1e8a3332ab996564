// SPDX-License-Identifier: GPL-3.0-only

//! Engine configuration
//!
//! Everything the caller decides before probe: which disks the engine may
//! touch, how aggressive clearing is, and the LUKS passphrases it may use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which preexisting partitions the partitioner may clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearPartType {
    None,
    /// Only partitions carrying Linux-native formats.
    Linux,
    All,
}

impl Default for ClearPartType {
    fn default() -> Self {
        ClearPartType::None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Disks the engine must never touch or even model.
    pub ignored_disks: Vec<String>,
    /// When non-empty, the engine refuses to operate on any disk not
    /// listed here.
    pub exclusive_disks: Vec<String>,
    pub clear_part_type: ClearPartType,
    /// Disks clearing applies to; empty means all eligible disks.
    pub clear_part_disks: Vec<String>,
    /// Permit reinitializing disks with unreadable disklabels and
    /// automatic teardown of inconsistent VGs.
    pub zero_mbr: bool,
    /// Disks whose labels are rewritten unconditionally.
    pub reinitialize_disks: Vec<String>,
    /// Device specs (UUID=, LABEL=, /dev/...) that must never be modified.
    pub protected_specs: Vec<String>,
    /// Per-device LUKS passphrases, keyed by device path.
    pub luks_passphrases: BTreeMap<String, String>,
    /// Fallback passphrase for any LUKS device without its own entry.
    pub luks_global_passphrase: Option<String>,
}

impl StorageConfig {
    pub fn disk_is_ignored(&self, name: &str) -> bool {
        if self.ignored_disks.iter().any(|d| d == name) {
            return true;
        }
        !self.exclusive_disks.is_empty() && !self.exclusive_disks.iter().any(|d| d == name)
    }

    pub fn passphrase_for(&self, device_path: &str) -> Option<&str> {
        self.luks_passphrases
            .get(device_path)
            .or(self.luks_global_passphrase.as_ref())
            .map(String::as_str)
    }
}
