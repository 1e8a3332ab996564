// SPDX-License-Identifier: GPL-3.0-only

//! Size arithmetic for the storage model
//!
//! The whole model speaks MiB. Tools report bytes or 512-byte sectors;
//! conversion happens once, at the storage-sys boundary, rounding down.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Logical sector size assumed throughout; 4Kn disks are addressed through
/// their 512-byte emulation by every tool this engine drives.
pub const SECTOR_SIZE: u64 = 512;

const SECTORS_PER_MIB: u64 = 1024 * 1024 / SECTOR_SIZE;

/// A size in mebibytes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Mib(pub u64);

impl Mib {
    pub const ZERO: Mib = Mib(0);

    /// Convert a byte count, rounding down to whole MiB.
    pub fn from_bytes(bytes: u64) -> Self {
        Mib(bytes / (1024 * 1024))
    }

    /// Convert a 512-byte sector count, rounding down to whole MiB.
    pub fn from_sectors(sectors: u64) -> Self {
        Mib(sectors / SECTORS_PER_MIB)
    }

    pub fn to_bytes(self) -> u64 {
        self.0 * 1024 * 1024
    }

    pub fn to_sectors(self) -> u64 {
        self.0 * SECTORS_PER_MIB
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Mib) -> Mib {
        Mib(self.0.saturating_sub(other.0))
    }

    pub fn min(self, other: Mib) -> Mib {
        Mib(self.0.min(other.0))
    }

    pub fn max(self, other: Mib) -> Mib {
        Mib(self.0.max(other.0))
    }

    /// Round up to the next multiple of `grain` MiB. A zero grain is an
    /// identity.
    pub fn align_up(self, grain: Mib) -> Mib {
        if grain.0 == 0 {
            return self;
        }
        Mib(self.0.div_ceil(grain.0) * grain.0)
    }
}

impl Add for Mib {
    type Output = Mib;

    fn add(self, rhs: Mib) -> Mib {
        Mib(self.0 + rhs.0)
    }
}

impl AddAssign for Mib {
    fn add_assign(&mut self, rhs: Mib) {
        self.0 += rhs.0;
    }
}

impl Sub for Mib {
    type Output = Mib;

    fn sub(self, rhs: Mib) -> Mib {
        Mib(self.0 - rhs.0)
    }
}

impl SubAssign for Mib {
    fn sub_assign(&mut self, rhs: Mib) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Mib {
    fn sum<I: Iterator<Item = Mib>>(iter: I) -> Mib {
        iter.fold(Mib::ZERO, Add::add)
    }
}

impl fmt::Display for Mib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MiB", self.0)
    }
}
