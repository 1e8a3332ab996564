// SPDX-License-Identifier: GPL-3.0-only

//! The action queue: pruning, ordering and execution.

mod execute;
mod prune;
mod sort;

pub use execute::{
    mount_filesystems, process_actions, DiskIo, MemoryDiskIo, SystemDiskIo,
};
pub use prune::prune_actions;
pub use sort::sort_actions;

/// Progress reporting seam, threaded through execution as a parameter
/// instead of callbacks buried in every layer.
pub trait ProgressSink {
    fn start(&mut self, title: &str, total: usize);
    fn set(&mut self, value: usize);
    fn pulse(&mut self);
    fn pop(&mut self);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn start(&mut self, _title: &str, _total: usize) {}
    fn set(&mut self, _value: usize) {}
    fn pulse(&mut self) {}
    fn pop(&mut self) {}
}
