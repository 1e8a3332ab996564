// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("required tool not installed: {0}")]
    ToolMissing(String),

    #[error("{program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("cannot parse {source_name} output: {detail}")]
    ParseFailed { source_name: String, detail: String },

    #[error("failed to commit disklabel on {device}: {detail}")]
    DiskLabelCommit { device: String, detail: String },

    #[error("invalid disklabel on {0}")]
    InvalidDiskLabel(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
