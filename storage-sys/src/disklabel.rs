// SPDX-License-Identifier: GPL-3.0-only

//! Disklabel reading and committing
//!
//! GPT goes through gptman, the MSDOS primary table through mbrman.
//! Logical partitions are followed and written through the EBR chain by
//! hand; mbrman's view of the world stops at the four primary slots we
//! give it. All geometry is in 512-byte sectors.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use storage_types::{DiskLabelType, PartType, SECTOR_SIZE};

use crate::{Result, SysError};

/// What kind of payload a partition will carry; mapped to an MBR system
/// byte or a GPT type GUID at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTypeHint {
    LinuxFs,
    Swap,
    Raid,
    Lvm,
    Esp,
    PrepBoot,
    AppleBoot,
    Extended,
}

impl PartitionTypeHint {
    pub fn mbr_sys_byte(&self) -> u8 {
        match self {
            PartitionTypeHint::LinuxFs => 0x83,
            PartitionTypeHint::Swap => 0x82,
            PartitionTypeHint::Raid => 0xfd,
            PartitionTypeHint::Lvm => 0x8e,
            PartitionTypeHint::Esp => 0xef,
            PartitionTypeHint::PrepBoot => 0x41,
            PartitionTypeHint::AppleBoot => 0xaf,
            PartitionTypeHint::Extended => 0x05,
        }
    }

    pub fn gpt_type_guid(&self) -> [u8; 16] {
        match self {
            PartitionTypeHint::LinuxFs => guid_bytes(0x0FC63DAF, 0x8483, 0x4772, [0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4]),
            PartitionTypeHint::Swap => guid_bytes(0x0657FD6D, 0xA4AB, 0x43C4, [0x84, 0xE5, 0x09, 0x33, 0xC8, 0x4B, 0x4F, 0x4F]),
            PartitionTypeHint::Raid => guid_bytes(0xA19D880F, 0x05FC, 0x4D3B, [0xA0, 0x06, 0x74, 0x3F, 0x0F, 0x84, 0x91, 0x1E]),
            PartitionTypeHint::Lvm => guid_bytes(0xE6D6D379, 0xF507, 0x44C2, [0xA2, 0x3C, 0x23, 0x8F, 0x2A, 0x3D, 0xF9, 0x28]),
            PartitionTypeHint::Esp => guid_bytes(0xC12A7328, 0xF81F, 0x11D2, [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B]),
            PartitionTypeHint::PrepBoot => guid_bytes(0x9E1A2D38, 0xC612, 0x4316, [0xAA, 0x26, 0x8B, 0x49, 0x52, 0x1E, 0x5A, 0x8B]),
            PartitionTypeHint::AppleBoot => guid_bytes(0x426F6F74, 0x0000, 0x11AA, [0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC]),
            // No extended partitions on GPT; treat as plain Linux data.
            PartitionTypeHint::Extended => PartitionTypeHint::LinuxFs.gpt_type_guid(),
        }
    }
}

/// On-disk GUID layout: the first three fields are little-endian.
fn guid_bytes(a: u32, b: u16, c: u16, tail: [u8; 8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&a.to_le_bytes());
    out[4..6].copy_from_slice(&b.to_le_bytes());
    out[6..8].copy_from_slice(&c.to_le_bytes());
    out[8..16].copy_from_slice(&tail);
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelPartition {
    /// 1-based partition number.
    pub number: u32,
    pub part_type: PartType,
    pub type_hint: PartitionTypeHint,
    pub start: u64,
    pub length: u64,
    pub bootable: bool,
    pub name: Option<String>,
    /// Raw GPT type GUID as read from disk. An unchanged commit writes it
    /// back verbatim; planned partitions leave it None and get the
    /// `type_hint` GUID instead.
    pub gpt_type: Option<[u8; 16]>,
    /// Raw GPT unique partition GUID (the PARTUUID). Preserved across
    /// read/commit cycles; generated only for planned partitions.
    pub gpt_guid: Option<[u8; 16]>,
}

impl LabelPartition {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// In-memory image of a disk's partition table.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskLabelIo {
    pub label_type: DiskLabelType,
    pub disk_sectors: u64,
    /// GPT disk GUID as read from disk; a fresh one is generated only
    /// when a label is created from scratch.
    pub disk_guid: Option<[u8; 16]>,
    pub partitions: Vec<LabelPartition>,
}

/// Sector alignment constraint: valid starts satisfy
/// `start ≡ offset (mod grain)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub offset: u64,
    pub grain: u64,
}

impl Alignment {
    pub const SECTOR: Alignment = Alignment { offset: 0, grain: 1 };

    /// The modern 1 MiB optimum every current disk advertises.
    pub fn optimum() -> Alignment {
        Alignment {
            offset: 2048,
            grain: 2048,
        }
    }

    pub fn align_up(&self, sector: u64) -> u64 {
        let base = self.offset % self.grain.max(1);
        if sector <= base {
            return base.max(self.offset.min(self.grain));
        }
        let delta = sector - base;
        base + delta.div_ceil(self.grain.max(1)) * self.grain.max(1)
    }

    pub fn is_aligned(&self, sector: u64) -> bool {
        let grain = self.grain.max(1);
        sector % grain == self.offset % grain
    }

    /// Intersection of two constraints where one grain divides the other;
    /// None when they cannot be satisfied together.
    pub fn intersect(&self, other: &Alignment) -> Option<Alignment> {
        let (coarse, fine) = if self.grain >= other.grain {
            (self, other)
        } else {
            (other, self)
        };
        let fine_grain = fine.grain.max(1);
        if coarse.grain % fine_grain != 0 {
            return None;
        }
        if coarse.offset % fine_grain != fine.offset % fine_grain {
            return None;
        }
        Some(*coarse)
    }
}

/// Classify the label on `device` and read its partitions.
pub fn read_label(device: &Path) -> Result<DiskLabelIo> {
    let mut file = OpenOptions::new().read(true).open(device)?;

    if let Ok(gpt) = gptman::GPT::find_from(&mut file) {
        let mut partitions = Vec::new();
        for (number, entry) in gpt.iter() {
            if !entry.is_used() {
                continue;
            }
            partitions.push(LabelPartition {
                number,
                part_type: PartType::Primary,
                type_hint: hint_from_guid(entry.partition_type_guid),
                start: entry.starting_lba,
                length: entry.ending_lba - entry.starting_lba + 1,
                bootable: false,
                name: Some(entry.partition_name.as_str().to_string()),
                gpt_type: Some(entry.partition_type_guid),
                gpt_guid: Some(entry.unique_partition_guid),
            });
        }
        let disk_sectors = gpt.header.last_usable_lba + 34;
        return Ok(DiskLabelIo {
            label_type: DiskLabelType::Gpt,
            disk_sectors,
            disk_guid: Some(gpt.header.disk_guid),
            partitions,
        });
    }

    file.seek(SeekFrom::Start(0))?;
    let mbr = mbrman::MBR::read_from(&mut file, SECTOR_SIZE as u32)
        .map_err(|_| SysError::InvalidDiskLabel(device.display().to_string()))?;

    let mut partitions = Vec::new();
    let mut extended: Option<(u64, u64)> = None;
    for number in 1..=4u32 {
        let entry = &mbr[number as usize];
        if !entry.is_used() {
            continue;
        }
        let is_extended = entry.sys == 0x05 || entry.sys == 0x0f;
        if is_extended {
            extended = Some((entry.starting_lba as u64, entry.sectors as u64));
        }
        partitions.push(LabelPartition {
            number,
            part_type: if is_extended {
                PartType::Extended
            } else {
                PartType::Primary
            },
            type_hint: hint_from_sys(entry.sys),
            start: entry.starting_lba as u64,
            length: entry.sectors as u64,
            bootable: entry.boot == mbrman::BOOT_ACTIVE,
            name: None,
            gpt_type: None,
            gpt_guid: None,
        });
    }

    if let Some((ext_start, _ext_len)) = extended {
        partitions.extend(read_ebr_chain(&mut file, ext_start)?);
    }

    Ok(DiskLabelIo {
        label_type: DiskLabelType::Msdos,
        disk_sectors: mbr.disk_size as u64,
        disk_guid: None,
        partitions,
    })
}

fn hint_from_sys(sys: u8) -> PartitionTypeHint {
    match sys {
        0x82 => PartitionTypeHint::Swap,
        0xfd => PartitionTypeHint::Raid,
        0x8e => PartitionTypeHint::Lvm,
        0xef => PartitionTypeHint::Esp,
        0x41 => PartitionTypeHint::PrepBoot,
        0xaf => PartitionTypeHint::AppleBoot,
        0x05 | 0x0f => PartitionTypeHint::Extended,
        _ => PartitionTypeHint::LinuxFs,
    }
}

fn hint_from_guid(guid: [u8; 16]) -> PartitionTypeHint {
    use PartitionTypeHint::*;
    [Swap, Raid, Lvm, Esp, PrepBoot, AppleBoot]
        .into_iter()
        .find(|hint| hint.gpt_type_guid() == guid)
        .unwrap_or(LinuxFs)
}

fn read_entry(buf: &[u8]) -> (u8, u8, u64, u64) {
    let status = buf[0];
    let sys = buf[4];
    let start = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as u64;
    let sectors = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as u64;
    (status, sys, start, sectors)
}

/// Walk the EBR chain under an extended partition. Logical numbering
/// starts at 5 regardless of primary slot usage.
fn read_ebr_chain<F: Read + Seek>(file: &mut F, ext_start: u64) -> Result<Vec<LabelPartition>> {
    let mut partitions = Vec::new();
    let mut ebr_offset = 0u64;
    let mut number = 5u32;

    // A corrupt chain must not loop forever.
    for _ in 0..128 {
        let mut sector = [0u8; 512];
        file.seek(SeekFrom::Start((ext_start + ebr_offset) * SECTOR_SIZE))?;
        file.read_exact(&mut sector)?;
        if sector[510] != 0x55 || sector[511] != 0xaa {
            break;
        }

        let (status, sys, rel_start, sectors) = read_entry(&sector[446..462]);
        if sys != 0 && sectors != 0 {
            partitions.push(LabelPartition {
                number,
                part_type: PartType::Logical,
                type_hint: hint_from_sys(sys),
                start: ext_start + ebr_offset + rel_start,
                length: sectors,
                bootable: status == 0x80,
                name: None,
                gpt_type: None,
                gpt_guid: None,
            });
            number += 1;
        }

        let (_status, next_sys, next_rel, _next_len) = read_entry(&sector[462..478]);
        if next_sys == 0 || next_rel == 0 {
            break;
        }
        ebr_offset = next_rel;
    }

    Ok(partitions)
}

fn write_entry(buf: &mut [u8], status: u8, sys: u8, start: u64, sectors: u64) {
    buf[0] = status;
    // LBA-only; CHS fields get the conventional "overflow" filler.
    buf[1] = 0xfe;
    buf[2] = 0xff;
    buf[3] = 0xff;
    buf[4] = sys;
    buf[5] = 0xfe;
    buf[6] = 0xff;
    buf[7] = 0xff;
    buf[8..12].copy_from_slice(&(start as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&(sectors as u32).to_le_bytes());
}

fn write_ebr_chain<F: Write + Seek>(
    file: &mut F,
    ext_start: u64,
    logicals: &[&LabelPartition],
) -> Result<()> {
    for (index, part) in logicals.iter().enumerate() {
        // Each logical's EBR sits one alignment grain before its data;
        // we place it at the sector immediately preceding.
        let ebr_lba = part.start - 1;
        let mut sector = [0u8; 512];
        write_entry(
            &mut sector[446..462],
            if part.bootable { 0x80 } else { 0x00 },
            part.type_hint.mbr_sys_byte(),
            part.start - ebr_lba,
            part.length,
        );
        if let Some(next) = logicals.get(index + 1) {
            let next_ebr = next.start - 1;
            write_entry(
                &mut sector[462..478],
                0x00,
                0x05,
                next_ebr - ext_start,
                next.length + 1,
            );
        }
        sector[510] = 0x55;
        sector[511] = 0xaa;
        file.seek(SeekFrom::Start(ebr_lba * SECTOR_SIZE))?;
        file.write_all(&sector)?;
    }
    Ok(())
}

/// Commit an in-memory label to disk. Failure maps to `DiskLabelCommit`
/// so the executor can tear composites down and retry once.
pub fn commit_label(device: &Path, label: &DiskLabelIo) -> Result<()> {
    let commit_error = |detail: String| SysError::DiskLabelCommit {
        device: device.display().to_string(),
        detail,
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .map_err(|err| commit_error(err.to_string()))?;

    match label.label_type {
        DiskLabelType::Gpt => {
            // Existing partitions keep the exact GUIDs they were read
            // with; PARTUUID references and firmware boot entries point
            // at them. Only a from-scratch label gets fresh identity.
            let disk_guid = label
                .disk_guid
                .unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());
            let mut gpt = gptman::GPT::new_from(&mut file, SECTOR_SIZE, disk_guid)
                .map_err(|err| commit_error(err.to_string()))?;
            for part in &label.partitions {
                gpt[part.number] = gptman::GPTPartitionEntry {
                    partition_type_guid: part
                        .gpt_type
                        .unwrap_or_else(|| part.type_hint.gpt_type_guid()),
                    unique_partition_guid: part
                        .gpt_guid
                        .unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes()),
                    starting_lba: part.start,
                    ending_lba: part.start + part.length - 1,
                    attribute_bits: 0,
                    partition_name: part.name.as_deref().unwrap_or("").into(),
                };
            }
            gptman::GPT::write_protective_mbr_into(&mut file, SECTOR_SIZE)
                .map_err(|err| commit_error(err.to_string()))?;
            gpt.write_into(&mut file)
                .map_err(|err| commit_error(err.to_string()))?;
        }
        DiskLabelType::Msdos => {
            let mut mbr = mbrman::MBR::new_from(&mut file, SECTOR_SIZE as u32, [0x12, 0x34, 0x56, 0x78])
                .map_err(|err| commit_error(err.to_string()))?;
            let mut logicals: Vec<&LabelPartition> = Vec::new();
            let mut ext_start = None;
            for part in &label.partitions {
                match part.part_type {
                    PartType::Logical => logicals.push(part),
                    _ => {
                        if part.part_type == PartType::Extended {
                            ext_start = Some(part.start);
                        }
                        mbr[part.number as usize] = mbrman::MBRPartitionEntry {
                            boot: if part.bootable {
                                mbrman::BOOT_ACTIVE
                            } else {
                                mbrman::BOOT_INACTIVE
                            },
                            first_chs: mbrman::CHS::empty(),
                            sys: part.type_hint.mbr_sys_byte(),
                            last_chs: mbrman::CHS::empty(),
                            starting_lba: part.start as u32,
                            sectors: part.length as u32,
                        };
                    }
                }
            }
            mbr.write_into(&mut file)
                .map_err(|err| commit_error(err.to_string()))?;
            if let Some(ext_start) = ext_start {
                logicals.sort_by_key(|p| p.start);
                write_ebr_chain(&mut file, ext_start, &logicals)
                    .map_err(|err| commit_error(err.to_string()))?;
            }
        }
        other => {
            return Err(commit_error(format!(
                "cannot write {} labels",
                other.as_str()
            )));
        }
    }

    file.sync_all().map_err(|err| commit_error(err.to_string()))?;
    Ok(())
}
