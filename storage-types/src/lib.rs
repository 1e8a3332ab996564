// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the Forge installer storage engine
//!
//! This crate defines the single source of truth for all storage domain
//! types consumed across the stack:
//!
//! - **storage-sys**: fills these types from udev, sysfs and tool output
//! - **storage-core**: owns them inside the device tree and action queue
//!
//! The device and format hierarchies are flat tagged unions rather than
//! class trees: every `Device` is `common` fields plus a `DeviceExt` kind,
//! every `Format` is `common` fields plus a `FormatExt` kind. Operations
//! dispatch on the kind.

pub mod action;
pub mod device;
pub mod format;
pub mod raid;
pub mod request;
pub mod size;

pub use action::{Action, ActionKind, ObjectKind, ResizeDirection};
pub use device::{
    Device, DeviceCommon, DeviceExt, DeviceId, DiskExt, DiskVariant, DmRaidExt, LuksExt, LvExt,
    LvRequestBlock, MdExt, MdKind, MultipathExt, PartGeometry, PartType, PartitionExt,
    PartitionRequestBlock, VgExt,
};
pub use format::{
    get_format, DiskLabelExt, DiskLabelType, Format, FormatArgs, FormatCommon, FormatExt, FsExt,
    FsType, LuksFormatExt, MdMemberExt, PvExt,
};
pub use raid::{get_raid_min_members, RaidLevel};
pub use request::{PartSpec, PartitionRequest};
pub use size::{Mib, SECTOR_SIZE};
