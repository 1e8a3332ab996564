// SPDX-License-Identifier: GPL-3.0-only

//! s390 DASD handling
//!
//! A DASD is unusable until low-level formatted with a cdl layout; the
//! sysfs `status` attribute distinguishes the states.

use std::path::Path;

use crate::run::Runner;
use crate::sysfs;
use crate::{Result, SysError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DasdState {
    Online,
    Unformatted,
    Offline,
}

/// Interpret the sysfs device status for a dasd node.
pub fn state(sysfs: &Path) -> DasdState {
    match sysfs::dasd_status(sysfs).as_deref() {
        Some("online") => DasdState::Online,
        Some("unformatted") => DasdState::Unformatted,
        _ => DasdState::Offline,
    }
}

/// Low-level format with the compatible disk layout. Destroys everything
/// on the volume.
pub fn format(runner: &dyn Runner, device: &str) -> Result<()> {
    runner
        .run("dasdfmt", &["-y", "-d", "cdl", "-b", "4096", "-f", device])
        .map(|_| ())
}

/// Bus id ("0.0.0201") from the sysfs device link, used for dasd.conf and
/// the rd.dasd dracut argument.
pub fn bus_id(sys_block: &Path, name: &str) -> Result<String> {
    let device_link = sys_block.join(name).join("device");
    let target = std::fs::read_link(&device_link)?;
    target
        .file_name()
        .map(|id| id.to_string_lossy().to_string())
        .ok_or_else(|| SysError::ParseFailed {
            source_name: "sysfs device link".to_string(),
            detail: format!("no bus id under {}", device_link.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ScriptedRunner;

    #[test]
    fn format_uses_cdl_layout() {
        let runner = ScriptedRunner::new();
        format(&runner, "/dev/dasda").unwrap();
        assert!(runner.saw("dasdfmt", &["-y", "-d", "cdl", "-b", "4096", "/dev/dasda"]));
    }

    #[test]
    fn state_reads_sysfs_status() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("dasda");
        std::fs::create_dir_all(dev.join("device")).unwrap();
        std::fs::write(dev.join("device/status"), "unformatted\n").unwrap();
        assert_eq!(state(&dev), DasdState::Unformatted);
        assert_eq!(state(&dir.path().join("dasdb")), DasdState::Offline);
    }
}
