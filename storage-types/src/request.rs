// SPDX-License-Identifier: GPL-3.0-only

//! Partitioning requests
//!
//! A `PartitionRequest` is what the caller asks for ("500 MiB ext4 /boot,
//! primary"); the partitioner turns a set of them into concrete geometry.
//! `PartSpec` is the platform-policy flavor used for default layouts.

use serde::{Deserialize, Serialize};

use crate::format::FsType;
use crate::size::Mib;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub mountpoint: Option<String>,
    pub fs_type: FsType,
    pub size: Mib,
    pub min_size: Option<Mib>,
    pub max_size: Option<Mib>,
    pub grow: bool,
    pub primary: bool,
    pub bootable: bool,
    /// Larger weights are placed earlier and receive proportionally more
    /// of the free space when growing.
    pub weight: i32,
    /// Candidate disk names; empty means every eligible disk.
    pub disks: Vec<String>,
    pub label: Option<String>,
}

impl PartitionRequest {
    pub fn new(mountpoint: Option<&str>, fs_type: FsType, size: Mib) -> Self {
        PartitionRequest {
            mountpoint: mountpoint.map(str::to_string),
            fs_type,
            size,
            min_size: None,
            max_size: None,
            grow: false,
            primary: false,
            bootable: false,
            weight: 0,
            disks: Vec::new(),
            label: None,
        }
    }

    pub fn grow(mut self, max_size: Option<Mib>) -> Self {
        self.grow = true;
        self.max_size = max_size;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn bootable(mut self) -> Self {
        self.bootable = true;
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn on_disks(mut self, disks: &[&str]) -> Self {
        self.disks = disks.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Effective floor for allocation.
    pub fn base_size(&self) -> Mib {
        self.min_size.unwrap_or(self.size).max(self.size)
    }
}

/// A platform's default-partitioning entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartSpec {
    pub mountpoint: Option<String>,
    pub fs_type: FsType,
    pub size: Mib,
    pub max_size: Option<Mib>,
    pub grow: bool,
    /// Required specs survive even when the caller trims the layout.
    pub required: bool,
    pub weight: i32,
}

impl PartSpec {
    pub fn to_request(&self) -> PartitionRequest {
        PartitionRequest {
            mountpoint: self.mountpoint.clone(),
            fs_type: self.fs_type.clone(),
            size: self.size,
            min_size: None,
            max_size: self.max_size,
            grow: self.grow,
            primary: false,
            bootable: false,
            weight: self.weight,
            disks: Vec::new(),
            label: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chains_compose() {
        let req = PartitionRequest::new(Some("/"), FsType::Ext4, Mib(1024))
            .grow(Some(Mib(8192)))
            .primary()
            .weight(10)
            .on_disks(&["sda", "sdb"]);
        assert!(req.grow);
        assert_eq!(req.max_size, Some(Mib(8192)));
        assert!(req.primary);
        assert_eq!(req.disks, vec!["sda", "sdb"]);
    }

    #[test]
    fn base_size_prefers_the_larger_of_min_and_size() {
        let mut req = PartitionRequest::new(None, FsType::Swap, Mib(2000));
        assert_eq!(req.base_size(), Mib(2000));
        req.min_size = Some(Mib(3000));
        assert_eq!(req.base_size(), Mib(3000));
    }
}
