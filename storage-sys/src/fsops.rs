// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem tool adapters
//!
//! One binary per operation, fixed argv per §mkfs tool contract. Mounting
//! goes through the mount(2) syscall via nix rather than /bin/mount so the
//! engine controls flags exactly.

use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use storage_types::{FsType, Mib};

use crate::run::Runner;
use crate::{Result, SysError};

/// Create a filesystem of `fs_type` on `device`, with an optional label.
pub fn mkfs(runner: &dyn Runner, fs_type: &FsType, device: &str, label: Option<&str>) -> Result<()> {
    let program = fs_type.mkfs_program().ok_or_else(|| {
        SysError::OperationFailed(format!("{} cannot be created", fs_type.as_str()))
    })?;

    let mut args: Vec<&str> = Vec::new();
    match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            args.push("-F");
            if let Some(label) = label {
                args.extend_from_slice(&["-L", label]);
            }
        }
        FsType::Xfs => {
            args.push("-f");
            if let Some(label) = label {
                args.extend_from_slice(&["-L", label]);
            }
        }
        FsType::Btrfs | FsType::Jfs | FsType::Gfs2 => {
            if let Some(label) = label {
                args.extend_from_slice(&["-L", label]);
            }
        }
        FsType::Efi | FsType::Vfat => {
            if let Some(label) = label {
                args.extend_from_slice(&["-n", label]);
            }
        }
        FsType::Ntfs => {
            args.push("-f"); // quick format
            if let Some(label) = label {
                args.extend_from_slice(&["-L", label]);
            }
        }
        FsType::Hfs | FsType::HfsPlus | FsType::AppleBootstrap => {
            if let Some(label) = label {
                args.extend_from_slice(&["-l", label]);
            }
        }
        FsType::Swap => {
            if let Some(label) = label {
                args.extend_from_slice(&["-L", label]);
            }
        }
        _ => {}
    }
    args.push(device);
    runner.run(program, &args).map(|_| ())
}

/// fsck before resize; ext tools demand a clean filesystem.
pub fn fsck(runner: &dyn Runner, fs_type: &FsType, device: &str) -> Result<()> {
    match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            runner.run("e2fsck", &["-f", "-p", device]).map(|_| ())
        }
        FsType::Vfat | FsType::Efi => runner.run("dosfsck", &["-a", device]).map(|_| ()),
        _ => Ok(()),
    }
}

/// Set the filesystem label in place.
pub fn set_label(runner: &dyn Runner, fs_type: &FsType, device: &str, label: &str) -> Result<()> {
    match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            runner.run("tune2fs", &["-L", label, device]).map(|_| ())
        }
        FsType::Xfs => runner.run("xfs_admin", &["-L", label, device]).map(|_| ()),
        FsType::Jfs => runner.run("jfs_tune", &["-L", label, device]).map(|_| ()),
        FsType::Swap => runner.run("mkswap", &["-L", label, device]).map(|_| ()),
        other => Err(SysError::OperationFailed(format!(
            "cannot relabel {}",
            other.as_str()
        ))),
    }
}

/// Resize a filesystem to `new_size`. Only ext and ntfs resize here;
/// everything else reports unsupported.
pub fn resize(runner: &dyn Runner, fs_type: &FsType, device: &str, new_size: Mib) -> Result<()> {
    match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            let size_arg = format!("{}M", new_size.0);
            runner
                .run("resize2fs", &["-p", device, size_arg.as_str()])
                .map(|_| ())
        }
        FsType::Ntfs => {
            let size_arg = format!("{}M", new_size.0);
            runner
                .run("ntfsresize", &["-ff", "-s", size_arg.as_str(), device])
                .map(|_| ())
        }
        other => Err(SysError::OperationFailed(format!(
            "{} is not resizable",
            other.as_str()
        ))),
    }
}

/// Minimum size an ext filesystem can shrink to, from `resize2fs -P`.
/// Output: "Estimated minimum size of the filesystem: 656640" (4k blocks).
pub fn ext_min_size(runner: &dyn Runner, device: &str) -> Result<Mib> {
    let output = runner.run("resize2fs", &["-P", device])?;
    let blocks: u64 = output
        .stdout
        .lines()
        .find_map(|line| line.rsplit(':').next()?.trim().parse().ok())
        .ok_or_else(|| SysError::ParseFailed {
            source_name: "resize2fs -P".to_string(),
            detail: output.stdout.clone(),
        })?;
    Ok(Mib::from_bytes(blocks * 4096))
}

/// Minimum size for an ntfs filesystem, from `ntfsresize -m`.
/// Output contains: "Minsize (in MB): 1234".
pub fn ntfs_min_size(runner: &dyn Runner, device: &str) -> Result<Mib> {
    let output = runner.run("ntfsresize", &["-m", device])?;
    let mb: u64 = output
        .stdout
        .lines()
        .find(|line| line.contains("Minsize"))
        .and_then(|line| line.rsplit(':').next()?.trim().parse().ok())
        .ok_or_else(|| SysError::ParseFailed {
            source_name: "ntfsresize -m".to_string(),
            detail: output.stdout.clone(),
        })?;
    // ntfsresize reports SI megabytes; round up to be safe shrinking.
    Ok(Mib::from_bytes(mb * 1_000_000) + Mib(1))
}

/// One-way migration along ext2 -> ext3 -> ext4. Adding a journal to a
/// filesystem that already has one is a no-op for tune2fs, so repeated
/// migrations are harmless.
pub fn migrate(runner: &dyn Runner, from: &FsType, to: &FsType, device: &str) -> Result<()> {
    match (from, to) {
        (FsType::Ext2, FsType::Ext3) => runner.run("tune2fs", &["-j", device]).map(|_| ()),
        (FsType::Ext3, FsType::Ext4) => runner
            .run(
                "tune2fs",
                &["-O", "extents,uninit_bg,dir_index", device],
            )
            .map(|_| ()),
        (from, to) => Err(SysError::OperationFailed(format!(
            "no migration path from {} to {}",
            from.as_str(),
            to.as_str()
        ))),
    }
}

pub fn swapon(runner: &dyn Runner, device: &str) -> Result<()> {
    runner.run("swapon", &[device]).map(|_| ())
}

pub fn swapoff(runner: &dyn Runner, device: &str) -> Result<()> {
    runner.run("swapoff", &[device]).map(|_| ())
}

/// Mount `device` at `target`. `options` is the comma-separated string
/// from the format; flags the kernel knows are split out, the rest is
/// passed as fs data.
pub fn mount_fs(device: &str, target: &Path, fs_type: &str, options: Option<&str>) -> Result<()> {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options.unwrap_or("").split(',').filter(|o| !o.is_empty()) {
        match option {
            "ro" => flags.insert(MsFlags::MS_RDONLY),
            "nosuid" => flags.insert(MsFlags::MS_NOSUID),
            "nodev" => flags.insert(MsFlags::MS_NODEV),
            "noexec" => flags.insert(MsFlags::MS_NOEXEC),
            "bind" => flags.insert(MsFlags::MS_BIND),
            "defaults" | "rw" => {}
            other => data.push(other),
        }
    }
    let data = data.join(",");
    mount(
        Some(device),
        target,
        Some(fs_type),
        flags,
        if data.is_empty() { None } else { Some(data.as_str()) },
    )
    .map_err(|err| SysError::OperationFailed(format!("mount {device} at {target:?}: {err}")))
}

pub fn umount_fs(target: &Path) -> Result<()> {
    umount2(target, MntFlags::empty())
        .map_err(|err| SysError::OperationFailed(format!("umount {target:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ScriptedRunner;

    #[test]
    fn mkfs_picks_program_and_flags() {
        let runner = ScriptedRunner::new();
        mkfs(&runner, &FsType::Ext4, "/dev/sda1", Some("boot")).unwrap();
        assert!(runner.saw("mkfs.ext4", &["-F", "-L", "boot", "/dev/sda1"]));

        mkfs(&runner, &FsType::Vfat, "/dev/sda1", Some("EFI")).unwrap();
        assert!(runner.saw("mkfs.vfat", &["-n", "EFI", "/dev/sda1"]));

        mkfs(&runner, &FsType::Swap, "/dev/sda3", None).unwrap();
        assert!(runner.saw("mkswap", &["/dev/sda3"]));
    }

    #[test]
    fn mkfs_refuses_uncreatable_types() {
        let runner = ScriptedRunner::new();
        assert!(mkfs(&runner, &FsType::Iso9660, "/dev/sr0", None).is_err());
    }

    #[test]
    fn parses_resize2fs_min_size() {
        let runner = ScriptedRunner::new();
        runner.expect(
            "resize2fs",
            "resize2fs 1.47.0\nEstimated minimum size of the filesystem: 262144\n",
        );
        // 262144 blocks * 4096 = 1 GiB
        assert_eq!(ext_min_size(&runner, "/dev/sda2").unwrap(), Mib(1024));
    }

    #[test]
    fn parses_ntfsresize_min_size() {
        let runner = ScriptedRunner::new();
        runner.expect(
            "ntfsresize",
            "ntfsresize v2022.10.3\nSpace in use       : 5000 MB (48.2%)\nMinsize (in MB): 5000\n",
        );
        let min = ntfs_min_size(&runner, "/dev/sda3").unwrap();
        assert_eq!(min, Mib::from_bytes(5000 * 1_000_000) + Mib(1));
    }

    #[test]
    fn migration_paths_are_exact() {
        let runner = ScriptedRunner::new();
        migrate(&runner, &FsType::Ext2, &FsType::Ext3, "/dev/sda1").unwrap();
        assert!(runner.saw("tune2fs", &["-j", "/dev/sda1"]));
        assert!(migrate(&runner, &FsType::Ext2, &FsType::Ext4, "/dev/sda1").is_err());
        assert!(migrate(&runner, &FsType::Xfs, &FsType::Ext4, "/dev/sda1").is_err());
    }
}
