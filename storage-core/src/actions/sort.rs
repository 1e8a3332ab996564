// SPDX-License-Identifier: GPL-3.0-only

//! Execution ordering
//!
//! The queue is sorted by a total key instead of a pairwise comparator so
//! the order is transitive by construction. Destroys run first, deepest
//! device first, with a partition's format going before the partition
//! itself and partitions on one disk removed from the end of the label
//! backwards. Shrinks follow (filesystem before its device, dependents
//! first), then grows (device before filesystem, parents first), then
//! creates (parents first, partitions in ascending number, device before
//! format) and finally migrations.

use storage_types::{Action, DeviceExt, DeviceId, ObjectKind};

use crate::tree::DeviceTree;

/// Sort the queue into execution order. Serial breaks every remaining tie,
/// so registrations that are otherwise unordered run oldest first.
pub fn sort_actions(actions: &mut [Action], tree: &DeviceTree) {
    actions.sort_by_key(|a| sort_key(a, tree));
}

type SortKey = (u8, i64, DeviceId, i64, u8, u64);

fn sort_key(action: &Action, tree: &DeviceTree) -> SortKey {
    let depth = tree.depth(action.device) as i64;
    let device = tree.peek(action.device);

    // Partitions on the same disk are kept together and ordered by their
    // slot number; everything else groups by its own id.
    let (group, number) = match device {
        Some(d) => match (&d.kind, d.common.parents.first()) {
            (DeviceExt::Partition(ext), Some(&disk)) => {
                (disk, i64::from(ext.number.unwrap_or(0)))
            }
            _ => (action.device, 0),
        },
        None => (action.device, 0),
    };

    let (rank, depth_key, number_key, object_key) = if action.is_destroy() {
        // Format before device: wipe the fs, then drop the partition.
        (0, -depth, -number, u8::from(action.is_device()))
    } else if action.is_shrink() {
        // Format before device: the fs must fit before its container shrinks.
        (1, -depth, -number, u8::from(action.is_device()))
    } else if action.is_grow() {
        // Device before format: the container must grow before the fs fills it.
        (2, depth, number, u8::from(action.is_format()))
    } else if action.is_create() {
        // Device before format: nothing to format until the device exists.
        (3, depth, number, u8::from(action.is_format()))
    } else {
        (4, depth, number, 0)
    };

    (rank, depth_key, group, number_key, object_key, action.serial)
}
