// SPDX-License-Identifier: GPL-3.0-only

//! On-device content models
//!
//! A `Format` describes what lives *on* a block device: a disklabel, a
//! filesystem, a LUKS header, an LVM PV, an MD member signature and so on.
//! It parallels the device model: `FormatCommon` plus a `FormatExt` kind.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::size::Mib;

/// Partition table flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskLabelType {
    Msdos,
    Gpt,
    Bsd,
    Mac,
    Sun,
    Dasd,
}

impl Default for DiskLabelType {
    fn default() -> Self {
        DiskLabelType::Msdos
    }
}

impl DiskLabelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskLabelType::Msdos => "msdos",
            DiskLabelType::Gpt => "gpt",
            DiskLabelType::Bsd => "bsd",
            DiskLabelType::Mac => "mac",
            DiskLabelType::Sun => "sun",
            DiskLabelType::Dasd => "dasd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "msdos" | "dos" | "mbr" => Some(DiskLabelType::Msdos),
            "gpt" => Some(DiskLabelType::Gpt),
            "bsd" => Some(DiskLabelType::Bsd),
            "mac" => Some(DiskLabelType::Mac),
            "sun" => Some(DiskLabelType::Sun),
            "dasd" => Some(DiskLabelType::Dasd),
            _ => None,
        }
    }

    /// Primary partition slots before an extended partition is needed.
    /// Only MSDOS has the restriction.
    pub fn max_primary_count(&self) -> usize {
        match self {
            DiskLabelType::Msdos => 4,
            DiskLabelType::Gpt => 128,
            _ => 16,
        }
    }

    /// Partition alignment grain in sectors imposed by the label itself.
    pub fn alignment_grain_sectors(&self) -> u64 {
        match self {
            // MSDOS historically aligns to cylinders; modern practice is
            // sector granularity with the disk's optimum applied on top.
            DiskLabelType::Msdos => 1,
            DiskLabelType::Gpt => 1,
            _ => 1,
        }
    }
}

/// Filesystem types the engine recognizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Jfs,
    Gfs2,
    Hfs,
    HfsPlus,
    /// Apple Bootstrap HFS partition used by yaboot.
    AppleBootstrap,
    /// EFI system partition; vfat with a fixed mountpoint.
    Efi,
    Vfat,
    Ntfs,
    Iso9660,
    Nfs,
    Nfs4,
    Swap,
    /// Kernel pseudo-filesystems (proc, sysfs, tmpfs, devpts, bind...).
    NoDev(String),
}

impl Default for FsType {
    fn default() -> Self {
        FsType::Ext4
    }
}

impl FsType {
    pub fn as_str(&self) -> &str {
        match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
            FsType::Btrfs => "btrfs",
            FsType::Jfs => "jfs",
            FsType::Gfs2 => "gfs2",
            FsType::Hfs => "hfs",
            FsType::HfsPlus => "hfs+",
            FsType::AppleBootstrap => "appleboot",
            FsType::Efi => "efi",
            FsType::Vfat => "vfat",
            FsType::Ntfs => "ntfs",
            FsType::Iso9660 => "iso9660",
            FsType::Nfs => "nfs",
            FsType::Nfs4 => "nfs4",
            FsType::Swap => "swap",
            FsType::NoDev(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let fs = match name {
            "ext2" => FsType::Ext2,
            "ext3" => FsType::Ext3,
            "ext4" => FsType::Ext4,
            "xfs" => FsType::Xfs,
            "btrfs" => FsType::Btrfs,
            "jfs" => FsType::Jfs,
            "gfs2" => FsType::Gfs2,
            "hfs" => FsType::Hfs,
            "hfs+" | "hfsplus" => FsType::HfsPlus,
            "appleboot" => FsType::AppleBootstrap,
            "efi" => FsType::Efi,
            "vfat" | "fat32" | "fat16" => FsType::Vfat,
            "ntfs" | "ntfs-3g" => FsType::Ntfs,
            "iso9660" => FsType::Iso9660,
            "nfs" => FsType::Nfs,
            "nfs4" => FsType::Nfs4,
            "swap" => FsType::Swap,
            "bind" | "proc" | "sysfs" | "devpts" | "tmpfs" | "usbfs" | "selinuxfs" => {
                FsType::NoDev(name.to_string())
            }
            _ => return None,
        };
        Some(fs)
    }

    /// mkfs binary for the type, None when the type cannot be created.
    pub fn mkfs_program(&self) -> Option<&'static str> {
        match self {
            FsType::Ext2 => Some("mkfs.ext2"),
            FsType::Ext3 => Some("mkfs.ext3"),
            FsType::Ext4 => Some("mkfs.ext4"),
            FsType::Xfs => Some("mkfs.xfs"),
            FsType::Btrfs => Some("mkfs.btrfs"),
            FsType::Jfs => Some("mkfs.jfs"),
            FsType::Gfs2 => Some("mkfs.gfs2"),
            FsType::Hfs | FsType::HfsPlus | FsType::AppleBootstrap => Some("hformat"),
            FsType::Efi | FsType::Vfat => Some("mkfs.vfat"),
            FsType::Ntfs => Some("mkfs.ntfs"),
            FsType::Swap => Some("mkswap"),
            FsType::Iso9660 | FsType::Nfs | FsType::Nfs4 | FsType::NoDev(_) => None,
        }
    }

    pub fn is_resizable(&self) -> bool {
        matches!(
            self,
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 | FsType::Ntfs
        )
    }

    /// Migration targets form the chain ext2 -> ext3 -> ext4.
    pub fn migration_target(&self) -> Option<FsType> {
        match self {
            FsType::Ext2 => Some(FsType::Ext3),
            FsType::Ext3 => Some(FsType::Ext4),
            _ => None,
        }
    }

    pub fn is_mountable(&self) -> bool {
        !matches!(self, FsType::Swap | FsType::AppleBootstrap)
    }

    /// Static lower bound for a new filesystem of this type. Resizable
    /// types refine this at runtime from the resize tool.
    pub fn min_size(&self) -> Mib {
        match self {
            FsType::Gfs2 => Mib(512),
            FsType::Ntfs => Mib(10),
            FsType::Btrfs => Mib(256),
            _ => Mib(1),
        }
    }

    /// Static upper bound; conservative figures good enough for sizing
    /// decisions, not filesystem-theoretical limits.
    pub fn max_size(&self) -> Mib {
        match self {
            FsType::Vfat | FsType::Efi => Mib(2 * 1024 * 1024), // 2 TiB
            FsType::Hfs | FsType::HfsPlus | FsType::AppleBootstrap => Mib(2 * 1024 * 1024),
            FsType::Ext2 | FsType::Ext3 => Mib(16 * 1024 * 1024), // 16 TiB
            FsType::Ext4 => Mib(1 << 40),                         // 1 EiB
            _ => Mib(1 << 44),
        }
    }
}

/// Fields shared by all formats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatCommon {
    /// Path of the backing block device, when known.
    pub device: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    /// True iff the signature is currently on disk.
    pub exists: bool,
    /// Mount/activation options string.
    pub options: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsExt {
    pub fs_type: FsType,
    pub mountpoint: Option<String>,
    pub mounted: bool,
    pub target_size: Option<Mib>,
    pub migrate_to: Option<FsType>,
    /// Smallest size the filesystem reports it can shrink to; queried
    /// once per format and cached here.
    pub min_size: Option<Mib>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LuksFormatExt {
    pub cipher: String,
    pub key_size_bits: u32,
    /// Never serialized; the passphrase only lives in memory.
    #[serde(skip)]
    pub passphrase: Option<String>,
    pub key_file: Option<PathBuf>,
    pub escrow_cert: Option<PathBuf>,
    pub backup_passphrase: bool,
    /// Device-mapper name the opened device will carry: `luks-<uuid>`.
    pub map_name: Option<String>,
}

impl Default for LuksFormatExt {
    fn default() -> Self {
        LuksFormatExt {
            cipher: "aes-xts-plain".to_string(),
            key_size_bits: 512,
            passphrase: None,
            key_file: None,
            escrow_cert: None,
            backup_passphrase: false,
            map_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PvExt {
    pub vg_name: Option<String>,
    pub vg_uuid: Option<String>,
    /// Offset of the first physical extent.
    pub pe_start: Mib,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MdMemberExt {
    pub md_uuid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskLabelExt {
    pub label_type: DiskLabelType,
}

/// Type-specific format state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatExt {
    DiskLabel(DiskLabelExt),
    Filesystem(FsExt),
    Luks(LuksFormatExt),
    LvmPv(PvExt),
    MdMember(MdMemberExt),
    DmRaidMember,
    MultipathMember,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub common: FormatCommon,
    pub kind: FormatExt,
}

impl Format {
    pub fn unformatted() -> Self {
        Format {
            common: FormatCommon::default(),
            kind: FormatExt::Unknown,
        }
    }

    /// The canonical type name, round-tripping through `get_format`.
    pub fn type_name(&self) -> &str {
        match &self.kind {
            FormatExt::DiskLabel(ext) => ext.label_type.as_str(),
            FormatExt::Filesystem(ext) => ext.fs_type.as_str(),
            FormatExt::Luks(_) => "luks",
            FormatExt::LvmPv(_) => "lvmpv",
            FormatExt::MdMember(_) => "mdmember",
            FormatExt::DmRaidMember => "dmraidmember",
            FormatExt::MultipathMember => "multipath_member",
            FormatExt::Unknown => "unknown",
        }
    }

    pub fn is_disklabel(&self) -> bool {
        matches!(self.kind, FormatExt::DiskLabel(_))
    }

    pub fn is_luks(&self) -> bool {
        matches!(self.kind, FormatExt::Luks(_))
    }

    pub fn is_pv(&self) -> bool {
        matches!(self.kind, FormatExt::LvmPv(_))
    }

    pub fn is_md_member(&self) -> bool {
        matches!(self.kind, FormatExt::MdMember(_))
    }

    pub fn as_fs(&self) -> Option<&FsExt> {
        match &self.kind {
            FormatExt::Filesystem(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn as_fs_mut(&mut self) -> Option<&mut FsExt> {
        match &mut self.kind {
            FormatExt::Filesystem(ext) => Some(ext),
            _ => None,
        }
    }

    pub fn mountpoint(&self) -> Option<&str> {
        self.as_fs().and_then(|fs| fs.mountpoint.as_deref())
    }

    /// Formats that linger without a mountable payload (members of RAID,
    /// multipath, LVM) are "container" formats; destroying their owner
    /// implies destroying them.
    pub fn is_member_format(&self) -> bool {
        matches!(
            self.kind,
            FormatExt::LvmPv(_)
                | FormatExt::MdMember(_)
                | FormatExt::DmRaidMember
                | FormatExt::MultipathMember
        )
    }
}

/// Explicit construction arguments, replacing ad-hoc keyword dictionaries.
#[derive(Debug, Clone, Default)]
pub struct FormatArgs {
    pub device: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub exists: bool,
    pub options: Option<String>,
    pub mountpoint: Option<String>,
    pub passphrase: Option<String>,
    pub key_file: Option<PathBuf>,
    pub escrow_cert: Option<PathBuf>,
    pub backup_passphrase: bool,
    pub vg_name: Option<String>,
    pub vg_uuid: Option<String>,
    pub md_uuid: Option<String>,
}

/// Build a format by type name. Unrecognized names yield `Unknown` so probe
/// output never fails classification outright.
pub fn get_format(type_name: &str, args: FormatArgs) -> Format {
    let common = FormatCommon {
        device: args.device.clone(),
        uuid: args.uuid.clone(),
        label: args.label.clone(),
        exists: args.exists,
        options: args.options.clone(),
    };

    let kind = if let Some(label_type) = DiskLabelType::from_name(type_name) {
        FormatExt::DiskLabel(DiskLabelExt { label_type })
    } else if let Some(fs_type) = FsType::from_name(type_name) {
        FormatExt::Filesystem(FsExt {
            fs_type,
            mountpoint: args.mountpoint,
            mounted: false,
            target_size: None,
            migrate_to: None,
            min_size: None,
        })
    } else {
        match type_name {
            "luks" | "crypto_LUKS" => FormatExt::Luks(LuksFormatExt {
                passphrase: args.passphrase,
                key_file: args.key_file,
                escrow_cert: args.escrow_cert,
                backup_passphrase: args.backup_passphrase,
                map_name: args.uuid.as_deref().map(|uuid| format!("luks-{uuid}")),
                ..LuksFormatExt::default()
            }),
            "lvmpv" | "LVM2_member" => FormatExt::LvmPv(PvExt {
                vg_name: args.vg_name,
                vg_uuid: args.vg_uuid,
                pe_start: Mib(1),
            }),
            "mdmember" | "linux_raid_member" => FormatExt::MdMember(MdMemberExt {
                md_uuid: args.md_uuid,
            }),
            "dmraidmember" => FormatExt::DmRaidMember,
            "multipath_member" => FormatExt::MultipathMember,
            _ => FormatExt::Unknown,
        }
    };

    Format { common, kind }
}
