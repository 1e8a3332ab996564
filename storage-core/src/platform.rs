// SPDX-License-Identifier: GPL-3.0-only

//! Per-architecture boot policy
//!
//! Everything the engine must know about an architecture sits behind the
//! `Platform` trait: which disklabel to write, what the boot partition
//! must look like, the default layout, and the sort weights that push
//! boot partitions to the front of the disk. The partitioner and the
//! action layer consume the trait; nothing else in the engine branches on
//! architecture.

use storage_types::{
    Device, DeviceExt, DiskLabelType, FsType, Mib, PartSpec, PartitionRequest,
};

use crate::tree::DeviceTree;

/// /boot bounds shared by the BIOS-style platforms.
const BOOT_MIN: Mib = Mib(50);
const BOOT_MAX: Mib = Mib(2048);

pub trait Platform {
    fn name(&self) -> &'static str;

    fn default_boot_fs_type(&self) -> FsType {
        FsType::Ext4
    }

    /// Label type to write on a blank or reinitialized disk.
    fn disk_label_type(&self, _disk: &Device) -> DiskLabelType {
        DiskLabelType::Msdos
    }

    /// Label types this platform can boot from; anything else on a boot
    /// disk is a validation error.
    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Msdos, DiskLabelType::Gpt]
    }

    /// The device the bootloader configuration will point at: whatever is
    /// mounted at /boot, falling back to /.
    fn boot_device<'a>(&self, tree: &'a DeviceTree) -> Option<&'a Device> {
        let mountpoints = tree.mountpoints();
        mountpoints
            .get("/boot")
            .or_else(|| mountpoints.get("/"))
            .and_then(|&id| tree.get(id))
    }

    /// Validate a bootable partition request. Returns human-readable
    /// problems; empty means acceptable.
    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String>;

    fn default_partitioning(&self) -> Vec<PartSpec>;

    /// Placement weight. Larger weights allocate earlier and closer to
    /// the start of the disk.
    fn weight(&self, fs_type: &FsType, mountpoint: Option<&str>) -> i32;

    /// First sector a partition may occupy on `disk`.
    fn minimum_sector(&self, _disk: &Device) -> u64 {
        0
    }
}

fn check_linux_boot(request: &PartitionRequest) -> Vec<String> {
    let mut problems = Vec::new();
    if !matches!(
        request.fs_type,
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4
    ) {
        problems.push(format!(
            "bootable partition cannot use {}",
            request.fs_type.as_str()
        ));
    }
    if request.size < BOOT_MIN {
        problems.push(format!("bootable partition must be at least {BOOT_MIN}"));
    }
    if request.size > BOOT_MAX {
        problems.push(format!("bootable partition must be at most {BOOT_MAX}"));
    }
    problems
}

fn spec(mountpoint: Option<&str>, fs_type: FsType, size: Mib, grow: bool, weight: i32) -> PartSpec {
    PartSpec {
        mountpoint: mountpoint.map(str::to_string),
        fs_type,
        size,
        max_size: None,
        grow,
        required: true,
        weight,
    }
}

fn base_layout(boot_fs: FsType, boot_weight: i32) -> Vec<PartSpec> {
    vec![
        spec(Some("/boot"), boot_fs, Mib(500), false, boot_weight),
        spec(Some("/"), FsType::Ext4, Mib(1024), true, 0),
        spec(None, FsType::Swap, Mib(2000), false, -1),
    ]
}

/// BIOS x86: MSDOS label, ext /boot.
#[derive(Debug, Default)]
pub struct X86;

impl Platform for X86 {
    fn name(&self) -> &'static str {
        "x86"
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        check_linux_boot(request)
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        base_layout(FsType::Ext4, 2000)
    }

    fn weight(&self, _fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match mountpoint {
            Some("/boot") => 2000,
            _ => 0,
        }
    }
}

/// UEFI: GPT label plus an EFI system partition at /boot/efi.
#[derive(Debug, Default)]
pub struct Efi;

impl Platform for Efi {
    fn name(&self) -> &'static str {
        "efi"
    }

    fn disk_label_type(&self, _disk: &Device) -> DiskLabelType {
        DiskLabelType::Gpt
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Gpt]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        let mut problems = Vec::new();
        if !matches!(request.fs_type, FsType::Efi | FsType::Vfat) {
            problems.push("the EFI system partition must be vfat".to_string());
        }
        if request.size < Mib(50) {
            problems.push("the EFI system partition must be at least 50 MiB".to_string());
        }
        problems
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        let mut layout = vec![spec(Some("/boot/efi"), FsType::Efi, Mib(200), false, 5000)];
        layout.extend(base_layout(FsType::Ext4, 2000));
        layout
    }

    fn weight(&self, fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match (fs_type, mountpoint) {
            (FsType::Efi, _) | (_, Some("/boot/efi")) => 5000,
            (_, Some("/boot")) => 2000,
            _ => 0,
        }
    }
}

/// IBM pSeries / iSeries: a PReP boot partition leads the disk.
#[derive(Debug, Default)]
pub struct PpcIseries;

impl Platform for PpcIseries {
    fn name(&self) -> &'static str {
        "ppc-iseries"
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Msdos]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        let mut problems = Vec::new();
        if request.size > Mib(10) {
            problems.push("PReP boot partition must be at most 10 MiB".to_string());
        }
        problems
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        let mut layout = vec![spec(None, FsType::Ext2, Mib(4), false, 5000)];
        layout.extend(base_layout(FsType::Ext4, 2000));
        layout
    }

    fn weight(&self, _fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match mountpoint {
            Some("/boot") => 2000,
            None => 5000,
            _ => 0,
        }
    }
}

/// Apple NewWorld PPC: HFS Apple Bootstrap partition for yaboot.
#[derive(Debug, Default)]
pub struct PpcNewWorld;

impl Platform for PpcNewWorld {
    fn name(&self) -> &'static str {
        "ppc-newworld"
    }

    fn disk_label_type(&self, _disk: &Device) -> DiskLabelType {
        DiskLabelType::Mac
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Mac]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        let mut problems = Vec::new();
        if request.fs_type != FsType::AppleBootstrap {
            problems.push("the bootstrap partition must be Apple Bootstrap HFS".to_string());
        }
        if request.size > Mib(10) {
            problems.push("the bootstrap partition must be at most 10 MiB".to_string());
        }
        problems
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        let mut layout = vec![spec(None, FsType::AppleBootstrap, Mib(1), false, 5000)];
        layout.extend(base_layout(FsType::Ext4, 2000));
        layout
    }

    fn weight(&self, fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match (fs_type, mountpoint) {
            (FsType::AppleBootstrap, _) => 5000,
            (_, Some("/boot")) => 2000,
            _ => 0,
        }
    }
}

/// Sony PS3: plain MSDOS, kernel loaded from /boot.
#[derive(Debug, Default)]
pub struct PpcPs3;

impl Platform for PpcPs3 {
    fn name(&self) -> &'static str {
        "ppc-ps3"
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Msdos]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        check_linux_boot(request)
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        base_layout(FsType::Ext4, 2000)
    }

    fn weight(&self, _fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match mountpoint {
            Some("/boot") => 2000,
            _ => 0,
        }
    }
}

/// IBM System z: DASD disks with their own label format.
#[derive(Debug, Default)]
pub struct S390;

impl Platform for S390 {
    fn name(&self) -> &'static str {
        "s390"
    }

    fn disk_label_type(&self, disk: &Device) -> DiskLabelType {
        match &disk.kind {
            DeviceExt::Disk(ext) if matches!(ext.variant, storage_types::DiskVariant::Dasd { .. }) => {
                DiskLabelType::Dasd
            }
            _ => DiskLabelType::Msdos,
        }
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Dasd, DiskLabelType::Msdos]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        check_linux_boot(request)
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        base_layout(FsType::Ext4, 2000)
    }

    fn weight(&self, _fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match mountpoint {
            Some("/boot") => 2000,
            _ => 0,
        }
    }
}

/// Sun SPARC: sun disklabels, ext /boot.
#[derive(Debug, Default)]
pub struct Sparc;

impl Platform for Sparc {
    fn name(&self) -> &'static str {
        "sparc"
    }

    fn disk_label_type(&self, _disk: &Device) -> DiskLabelType {
        DiskLabelType::Sun
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Sun]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        check_linux_boot(request)
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        base_layout(FsType::Ext4, 2000)
    }

    fn weight(&self, _fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match mountpoint {
            Some("/boot") => 2000,
            _ => 0,
        }
    }
}

/// Alpha SRM: MSDOS label with /boot on the first partition.
#[derive(Debug, Default)]
pub struct Alpha;

impl Platform for Alpha {
    fn name(&self) -> &'static str {
        "alpha"
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Msdos]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        let mut problems = check_linux_boot(request);
        if !request.primary {
            problems.push("aboot requires /boot on a primary partition".to_string());
        }
        problems
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        base_layout(FsType::Ext2, 2000)
    }

    fn weight(&self, _fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        match mountpoint {
            Some("/boot") => 2000,
            _ => 0,
        }
    }

    fn minimum_sector(&self, _disk: &Device) -> u64 {
        // aboot lives in the first sectors; keep partitions clear of it.
        2048
    }
}

/// Itanium: GPT plus an EFI system partition, like UEFI x86.
#[derive(Debug, Default)]
pub struct Ia64;

impl Platform for Ia64 {
    fn name(&self) -> &'static str {
        "ia64"
    }

    fn disk_label_type(&self, _disk: &Device) -> DiskLabelType {
        DiskLabelType::Gpt
    }

    fn required_disk_label_types(&self) -> &'static [DiskLabelType] {
        &[DiskLabelType::Gpt]
    }

    fn check_boot_request(&self, request: &PartitionRequest) -> Vec<String> {
        Efi.check_boot_request(request)
    }

    fn default_partitioning(&self) -> Vec<PartSpec> {
        Efi.default_partitioning()
    }

    fn weight(&self, fs_type: &FsType, mountpoint: Option<&str>) -> i32 {
        Efi.weight(fs_type, mountpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_weights_order_boot_partitions_first() {
        let efi = Efi;
        let esp = efi.weight(&FsType::Efi, Some("/boot/efi"));
        let boot = efi.weight(&FsType::Ext4, Some("/boot"));
        let root = efi.weight(&FsType::Ext4, Some("/"));
        assert!(esp > boot);
        assert!(boot > root);
    }

    #[test]
    fn x86_rejects_odd_boot_requests() {
        let platform = X86;
        let ok = PartitionRequest::new(Some("/boot"), FsType::Ext4, Mib(500)).bootable();
        assert!(platform.check_boot_request(&ok).is_empty());

        let xfs = PartitionRequest::new(Some("/boot"), FsType::Xfs, Mib(500)).bootable();
        assert_eq!(platform.check_boot_request(&xfs).len(), 1);

        let tiny = PartitionRequest::new(Some("/boot"), FsType::Ext4, Mib(10)).bootable();
        assert_eq!(platform.check_boot_request(&tiny).len(), 1);
    }

    #[test]
    fn efi_requires_a_vfat_esp() {
        let platform = Efi;
        let bad = PartitionRequest::new(Some("/boot/efi"), FsType::Ext4, Mib(200)).bootable();
        assert!(!platform.check_boot_request(&bad).is_empty());

        let good = PartitionRequest::new(Some("/boot/efi"), FsType::Efi, Mib(200)).bootable();
        assert!(platform.check_boot_request(&good).is_empty());
    }

    #[test]
    fn default_layouts_carry_the_platform_boot_partition() {
        assert!(Efi
            .default_partitioning()
            .iter()
            .any(|s| s.fs_type == FsType::Efi));
        assert!(PpcNewWorld
            .default_partitioning()
            .iter()
            .any(|s| s.fs_type == FsType::AppleBootstrap));
        assert!(X86
            .default_partitioning()
            .iter()
            .any(|s| s.mountpoint.as_deref() == Some("/boot")));
    }
}
