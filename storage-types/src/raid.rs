// SPDX-License-Identifier: GPL-3.0-only

//! MD RAID levels and membership rules

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// RAID levels the engine will create. Detected arrays of other levels are
/// modelled with their level string preserved but refuse creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
    /// External-metadata container (IMSM/DDF); not a data level.
    Container,
}

impl RaidLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaidLevel::Raid0 => "raid0",
            RaidLevel::Raid1 => "raid1",
            RaidLevel::Raid4 => "raid4",
            RaidLevel::Raid5 => "raid5",
            RaidLevel::Raid6 => "raid6",
            RaidLevel::Raid10 => "raid10",
            RaidLevel::Container => "container",
        }
    }

    /// Numeric level as mdadm prints it, None for containers.
    pub fn number(&self) -> Option<u32> {
        match self {
            RaidLevel::Raid0 => Some(0),
            RaidLevel::Raid1 => Some(1),
            RaidLevel::Raid4 => Some(4),
            RaidLevel::Raid5 => Some(5),
            RaidLevel::Raid6 => Some(6),
            RaidLevel::Raid10 => Some(10),
            RaidLevel::Container => None,
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaidLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raid0" | "0" | "stripe" => Ok(RaidLevel::Raid0),
            "raid1" | "1" | "mirror" => Ok(RaidLevel::Raid1),
            "raid4" | "4" => Ok(RaidLevel::Raid4),
            "raid5" | "5" => Ok(RaidLevel::Raid5),
            "raid6" | "6" => Ok(RaidLevel::Raid6),
            "raid10" | "10" => Ok(RaidLevel::Raid10),
            "container" => Ok(RaidLevel::Container),
            other => Err(format!("unsupported raid level: {other}")),
        }
    }
}

/// Minimum member count required to create an array of the given level.
pub fn get_raid_min_members(level: RaidLevel) -> usize {
    match level {
        RaidLevel::Raid0 | RaidLevel::Raid1 | RaidLevel::Raid10 => 2,
        RaidLevel::Raid4 | RaidLevel::Raid5 => 3,
        RaidLevel::Raid6 => 4,
        RaidLevel::Container => 2,
    }
}
