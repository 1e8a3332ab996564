// SPDX-License-Identifier: GPL-3.0-only

//! Partition allocation
//!
//! Turns a set of `PartitionRequest` entries into concrete partitions
//! registered on the tree. Requests are sorted by descending weight, then
//! descending base size, primaries first. Each request lands on the
//! candidate disk with the most free space (BIOS order breaks ties), fixed
//! sizes are allocated before growable requests share what is left in
//! proportion to their weight, and geometry is laid out front to back
//! under the disk's alignment. On an MSDOS label needing more than four
//! partitions, an extended partition takes the last primary slot and the
//! overflow becomes logical.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tracing::debug;

use storage_sys::disklabel::Alignment;
use storage_types::{
    get_format, Device, DeviceExt, DeviceId, DiskLabelType, FormatArgs, FormatExt, Mib,
    PartGeometry, PartType, PartitionExt, PartitionRequest, PartitionRequestBlock,
};

use crate::error::{Result, StorageError};
use crate::platform::Platform;
use crate::tree::DeviceTree;

/// Space reserved at the front of a disk for the label and boot code.
const LABEL_RESERVED: Mib = Mib(1);

#[derive(Debug)]
struct DiskState {
    id: DeviceId,
    name: String,
    label_type: DiskLabelType,
    alignment: Alignment,
    free: Mib,
    /// Sector where the next new partition may begin.
    cursor: u64,
    end_sector: u64,
    next_number: u32,
    existing_count: usize,
    /// Indices into the request list, in allocation order.
    assigned: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    number: u32,
    part_type: PartType,
    start: u64,
    length: u64,
}

/// Allocate every request, registering one partition device (and its
/// format) per request. Returns the new device ids in request order.
pub fn allocate_partitions(
    tree: &mut DeviceTree,
    platform: &dyn Platform,
    requests: &[PartitionRequest],
) -> Result<Vec<DeviceId>> {
    check_boot_requests(platform, requests)?;

    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by_key(|&i| {
        let r = &requests[i];
        (Reverse(r.weight), Reverse(r.base_size().0), !r.primary)
    });

    let mut disks = eligible_disks(tree, platform)?;

    // Pass 1: fixed allocations at base size, most-free disk first.
    let mut sizes: Vec<Mib> = requests.iter().map(PartitionRequest::base_size).collect();
    for &index in &order {
        let request = &requests[index];
        let base = sizes[index];
        let chosen = disks
            .iter()
            .enumerate()
            .filter(|(_, d)| request.disks.is_empty() || request.disks.contains(&d.name))
            .filter(|(_, d)| d.free >= base)
            .max_by_key(|(position, d)| (d.free, Reverse(*position)))
            .map(|(position, _)| position)
            .ok_or_else(|| {
                StorageError::Partitioning(format!(
                    "no disk can hold a {base} partition{}",
                    request
                        .mountpoint
                        .as_deref()
                        .map(|m| format!(" for {m}"))
                        .unwrap_or_default()
                ))
            })?;
        disks[chosen].free -= base;
        disks[chosen].assigned.push(index);
    }

    // Pass 2: grow, sharing each disk's remaining space by weight.
    for disk in disks.iter_mut() {
        grow_on_disk(disk, requests, &mut sizes);
    }

    // Pass 3: geometry and registration.
    let mut created = vec![0; requests.len()];
    for disk in &disks {
        if disk.assigned.is_empty() {
            continue;
        }
        let (slots, extended) = plan_slots(disk, requests, &sizes)?;
        if let Some(extended) = extended {
            register_extended(tree, disk, extended)?;
        }
        for (&index, slot) in disk.assigned.iter().zip(slots) {
            created[index] = register_partition(tree, disk, &requests[index], slot)?;
        }
    }

    Ok(created)
}

fn check_boot_requests(platform: &dyn Platform, requests: &[PartitionRequest]) -> Result<()> {
    let mut problems = Vec::new();
    for request in requests.iter().filter(|r| r.bootable) {
        problems.extend(platform.check_boot_request(request));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(StorageError::Partitioning(problems.join("; ")))
    }
}

/// Alignment for new partitions: the disk optimum intersected with the
/// label's grain, falling back to sector granularity.
fn disk_alignment(label_type: DiskLabelType) -> Alignment {
    let label = Alignment {
        offset: 0,
        grain: label_type.alignment_grain_sectors(),
    };
    Alignment::optimum()
        .intersect(&label)
        .unwrap_or(Alignment::SECTOR)
}

fn eligible_disks(tree: &DeviceTree, platform: &dyn Platform) -> Result<Vec<DiskState>> {
    let mut disks = Vec::new();
    for device in tree.devices() {
        if !device.is_partitionable() || tree.config.disk_is_ignored(device.name()) {
            continue;
        }
        let label_type = match device.format().map(|f| &f.kind) {
            Some(FormatExt::DiskLabel(ext)) => ext.label_type,
            _ => platform.disk_label_type(device),
        };
        let alignment = disk_alignment(label_type);

        let mut used = LABEL_RESERVED;
        let mut cursor = alignment.align_up(platform.minimum_sector(device).max(1));
        let mut next_number = 1;
        let mut existing_count = 0;
        for child in tree.children_of(device.id) {
            let Some(part) = tree.get(child).and_then(|d| d.as_partition()) else {
                continue;
            };
            existing_count += 1;
            if let Some(geometry) = part.geometry {
                used += geometry.size();
                cursor = cursor.max(alignment.align_up(geometry.end()));
            }
            if let Some(number) = part.number {
                if part.part_type != PartType::Logical {
                    next_number = next_number.max(number + 1);
                }
            }
        }

        disks.push(DiskState {
            id: device.id,
            name: device.name().to_string(),
            label_type,
            alignment,
            free: device.size().saturating_sub(used),
            cursor,
            end_sector: device.size().to_sectors(),
            next_number,
            existing_count,
            assigned: Vec::new(),
        });
    }
    if disks.is_empty() {
        return Err(StorageError::Partitioning(
            "no partitionable disks available".to_string(),
        ));
    }
    Ok(disks)
}

/// Water-filling growth: every growable request on the disk takes a
/// weight-proportional share of the free space each round, capped at its
/// max, until the disk is full or every request is capped.
fn grow_on_disk(disk: &mut DiskState, requests: &[PartitionRequest], sizes: &mut [Mib]) {
    loop {
        let growable: Vec<usize> = disk
            .assigned
            .iter()
            .copied()
            .filter(|&i| {
                requests[i].grow
                    && requests[i]
                        .max_size
                        .map(|max| sizes[i] < max)
                        .unwrap_or(true)
            })
            .collect();
        if growable.is_empty() || disk.free.is_zero() {
            return;
        }

        let total_weight: u64 = growable
            .iter()
            .map(|&i| requests[i].weight.max(1) as u64)
            .sum();
        let pool = disk.free;
        let mut granted = Mib::ZERO;
        for &i in &growable {
            let weight = requests[i].weight.max(1) as u64;
            let mut share = Mib((pool.0 * weight / total_weight).max(1));
            if let Some(max) = requests[i].max_size {
                share = share.min(max.saturating_sub(sizes[i]));
            }
            let share = share.min(pool.saturating_sub(granted));
            sizes[i] += share;
            granted += share;
        }
        disk.free -= granted;
        if granted.is_zero() {
            return;
        }
    }
}

/// Lay the disk's new partitions out front to back. Returns one slot per
/// assigned request plus the covering extended slot when MSDOS overflows
/// its primary table.
fn plan_slots(
    disk: &DiskState,
    requests: &[PartitionRequest],
    sizes: &[Mib],
) -> Result<(Vec<Slot>, Option<Slot>)> {
    let total = disk.existing_count + disk.assigned.len();
    let needs_extended =
        disk.label_type == DiskLabelType::Msdos && total > disk.label_type.max_primary_count();

    // The extended partition takes slot 4, so only three primary slots
    // remain in total.
    let primary_slots_left = if needs_extended {
        3usize.saturating_sub(disk.existing_count)
    } else {
        usize::MAX
    };

    let mut slots = Vec::with_capacity(disk.assigned.len());
    let mut cursor = disk.cursor;
    let mut number = disk.next_number;
    let mut logical_number = 5;
    let mut extended_start = None;

    for (order, &index) in disk.assigned.iter().enumerate() {
        let logical = needs_extended && order >= primary_slots_left;
        if logical && requests[index].primary {
            return Err(StorageError::Partitioning(format!(
                "no primary slot left on {} for a primary-only request",
                disk.name
            )));
        }
        let start = if logical {
            if extended_start.is_none() {
                extended_start = Some(disk.alignment.align_up(cursor));
            }
            // Leave the sector ahead free for the logical's EBR.
            disk.alignment.align_up(cursor + 1)
        } else {
            disk.alignment.align_up(cursor)
        };
        let length = sizes[index].to_sectors();
        if start + length > disk.end_sector {
            return Err(StorageError::Partitioning(format!(
                "allocation overflows {}",
                disk.name
            )));
        }
        let slot_number = if logical {
            logical_number += 1;
            logical_number - 1
        } else {
            number += 1;
            number - 1
        };
        slots.push(Slot {
            number: slot_number,
            part_type: if logical { PartType::Logical } else { PartType::Primary },
            start,
            length,
        });
        cursor = start + length;
    }

    let extended = extended_start.map(|start| Slot {
        number: 4,
        part_type: PartType::Extended,
        start,
        length: cursor - start,
    });
    debug!(disk = %disk.name, slots = slots.len(), "planned partition layout");
    Ok((slots, extended))
}

fn register_partition(
    tree: &mut DeviceTree,
    disk: &DiskState,
    request: &PartitionRequest,
    slot: Slot,
) -> Result<DeviceId> {
    let name = format!("{}{}", disk.name, slot.number);
    let mut device = Device::new(
        tree.next_device_id(),
        &name,
        DeviceExt::Partition(PartitionExt {
            part_type: slot.part_type,
            bootable: request.bootable,
            number: Some(slot.number),
            geometry: Some(PartGeometry {
                start: slot.start,
                length: slot.length,
            }),
            weight: request.weight,
            req: Some(PartitionRequestBlock {
                disks: request.disks.clone(),
                base_size: request.base_size(),
                min_size: request.min_size,
                max_size: request.max_size,
                grow: request.grow,
                primary_only: request.primary,
            }),
        }),
    );
    device.common.parents = vec![disk.id];
    device.common.size = Mib::from_sectors(slot.length);
    tree.register_create_device(device)?;
    let id = tree
        .get_by_name(&name)
        .map(|d| d.id)
        .ok_or_else(|| StorageError::DeviceTree(format!("{name} vanished after registration")))?;

    let format = get_format(
        request.fs_type.as_str(),
        FormatArgs {
            label: request.label.clone(),
            mountpoint: request.mountpoint.clone(),
            ..FormatArgs::default()
        },
    );
    tree.register_create_format(id, format)?;
    Ok(id)
}

fn register_extended(tree: &mut DeviceTree, disk: &DiskState, slot: Slot) -> Result<DeviceId> {
    let name = format!("{}{}", disk.name, slot.number);
    let mut device = Device::new(
        tree.next_device_id(),
        &name,
        DeviceExt::Partition(PartitionExt {
            part_type: PartType::Extended,
            number: Some(slot.number),
            geometry: Some(PartGeometry {
                start: slot.start,
                length: slot.length,
            }),
            ..PartitionExt::default()
        }),
    );
    device.common.parents = vec![disk.id];
    device.common.size = Mib::from_sectors(slot.length);
    tree.register_create_device(device)?;
    tree.get_by_name(&name)
        .map(|d| d.id)
        .ok_or_else(|| StorageError::DeviceTree(format!("{name} vanished after registration")))
}

/// Per-disk partition totals; the post-condition that allocations never
/// exceed a disk is checked against this in tests.
pub fn allocated_by_disk(tree: &DeviceTree) -> BTreeMap<String, Mib> {
    let mut sums = BTreeMap::new();
    for device in tree.devices() {
        if device.as_partition().is_none() {
            continue;
        }
        let Some(&parent) = device.common.parents.first() else {
            continue;
        };
        if let Some(disk) = tree.get(parent) {
            *sums.entry(disk.name().to_string()).or_insert(Mib::ZERO) += device.size();
        }
    }
    sums
}
