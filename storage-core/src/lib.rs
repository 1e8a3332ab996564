// SPDX-License-Identifier: GPL-3.0-only

//! Installer storage engine: probe the host's block devices into a device
//! tree, register the changes an installation needs as actions, then
//! prune, order and execute them against the system tools.
//!
//! The crate splits along the lifecycle:
//! - [`populate`] turns a [`populate::ProbeSnapshot`] into a [`tree::DeviceTree`];
//! - [`tree`] holds the model, the action queue and registration rules;
//! - [`partitioner`] turns [`storage_types::PartitionRequest`]s into geometry;
//! - [`actions`] prunes, sorts and executes the queue;
//! - [`conf`] and [`dracut`] emit what the installed system needs to boot.
//!
//! Policy that varies by architecture lives behind [`platform::Platform`].

pub mod actions;
pub mod conf;
pub mod config;
pub mod dracut;
mod error;
pub mod partitioner;
pub mod platform;
pub mod populate;
pub mod tree;

pub use actions::{
    mount_filesystems, process_actions, DiskIo, MemoryDiskIo, NullProgress, ProgressSink,
    SystemDiskIo,
};
pub use config::{ClearPartType, StorageConfig};
pub use error::{Result, StorageError};
pub use partitioner::allocate_partitions;
pub use populate::{populate, ProbeSnapshot};
pub use tree::DeviceTree;
