// SPDX-License-Identifier: GPL-3.0-only

//! Metadata wiping
//!
//! Zeroing the first and last MiB of a device removes every superblock
//! the probe would otherwise find again: disklabels, LUKS headers, md
//! superblocks (both 0.90 at the end and 1.x at the start), LVM labels.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use storage_types::Mib;

use crate::Result;

const WIPE_SPAN: u64 = 1024 * 1024;

/// Zero the first and last MiB of `device`. `size` is the device size;
/// devices smaller than 2 MiB are zeroed whole.
pub fn wipe_metadata(device: &Path, size: Mib) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(device)?;
    let total = size.to_bytes();
    let zeros = vec![0u8; WIPE_SPAN.min(total.max(1)) as usize];

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&zeros)?;

    if total > 2 * WIPE_SPAN {
        file.seek(SeekFrom::Start(total - WIPE_SPAN))?;
        file.write_all(&zeros)?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroes_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let image = vec![0xaau8; 4 * WIPE_SPAN as usize];
        std::fs::write(&path, &image).unwrap();

        wipe_metadata(&path, Mib(4)).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert!(data[..WIPE_SPAN as usize].iter().all(|&b| b == 0));
        assert!(data[3 * WIPE_SPAN as usize..].iter().all(|&b| b == 0));
        // The middle is untouched.
        assert!(data[2 * WIPE_SPAN as usize..3 * WIPE_SPAN as usize]
            .iter()
            .all(|&b| b == 0xaa));
    }
}
