// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// What step of a device's lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Create,
    Destroy,
    Resize,
    Setup,
    Teardown,
}

impl std::fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceOp::Create => "create",
            DeviceOp::Destroy => "destroy",
            DeviceOp::Resize => "resize",
            DeviceOp::Setup => "setup",
            DeviceOp::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("device {op} failed on {device}: {detail}")]
    Device {
        op: DeviceOp,
        device: String,
        detail: String,
    },

    #[error("user denied formatting of {0}")]
    UserDeniedFormat(String),

    #[error("format {op} failed on {device}: {detail}")]
    Format {
        op: DeviceOp,
        device: String,
        detail: String,
    },

    #[error("filesystem resize failed on {device}: {detail}")]
    FsResize { device: String, detail: String },

    #[error("filesystem migration failed on {device}: {detail}")]
    FsMigrate { device: String, detail: String },

    #[error("LUKS error on {device}: {detail}")]
    Luks { device: String, detail: String },

    #[error("MD member error on {device}: {detail}")]
    MdMember { device: String, detail: String },

    #[error("physical volume error on {device}: {detail}")]
    PhysicalVolume { device: String, detail: String },

    #[error("swap space error on {device}: {detail}")]
    SwapSpace { device: String, detail: String },

    #[error("invalid disklabel on {0}")]
    InvalidDiskLabel(String),

    #[error("disklabel commit failed on {device}: {detail}")]
    DiskLabelCommit { device: String, detail: String },

    #[error("device tree error: {0}")]
    DeviceTree(String),

    #[error("device action error: {0}")]
    DeviceAction(String),

    #[error("partitioning failed: {0}")]
    Partitioning(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("mdraid error: {0}")]
    MdRaid(String),

    #[error("lvm error: {0}")]
    Lvm(String),

    #[error("device-mapper error: {0}")]
    Dm(String),

    #[error("multipath error: {0}")]
    MPath(String),

    #[error("udev error: {0}")]
    Udev(String),

    #[error("unrecognized fstab entry: {0}")]
    UnrecognizedFstabEntry(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Sys(#[from] storage_sys::SysError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// The commit-retry path in the executor keys off this.
    pub fn is_disklabel_commit(&self) -> bool {
        matches!(self, StorageError::DiskLabelCommit { .. })
            || matches!(
                self,
                StorageError::Sys(storage_sys::SysError::DiskLabelCommit { .. })
            )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
