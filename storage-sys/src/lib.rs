// SPDX-License-Identifier: GPL-3.0-only

//! System-level access for the storage engine: udev, sysfs and procfs
//! readers, disklabel I/O, and adapters for the external tools (lvm,
//! mdadm, cryptsetup, multipath, mkfs and friends).
//!
//! Everything that shells out goes through the [`Runner`] trait so the
//! engine can be driven against canned tool output in tests.

pub mod crypto;
pub mod dasd;
pub mod disklabel;
mod error;
pub mod fsops;
pub mod lvm;
pub mod mdraid;
pub mod multipath;
pub mod procfs;
pub mod run;
pub mod sysfs;
pub mod udev;
pub mod wipe;

pub use error::{Result, SysError};
pub use run::{Runner, ScriptedRunner, SystemRunner, ToolOutput};
