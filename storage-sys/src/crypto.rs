// SPDX-License-Identifier: GPL-3.0-only

//! cryptsetup adapter
//!
//! Passphrases travel on stdin, never on the command line. The default
//! cipher/key-size pair matches what the installer has always written:
//! aes-xts-plain with a 512-bit key.

use std::fs;
use std::path::Path;

use crate::run::Runner;
use crate::{Result, SysError};

pub const DEFAULT_CIPHER: &str = "aes-xts-plain";
pub const DEFAULT_KEY_SIZE_BITS: u32 = 512;

pub fn luks_format(
    runner: &dyn Runner,
    device: &str,
    passphrase: &str,
    cipher: &str,
    key_size_bits: u32,
) -> Result<()> {
    if passphrase.is_empty() {
        return Err(SysError::OperationFailed(
            "cannot format LUKS without a passphrase".to_string(),
        ));
    }
    let key_size = key_size_bits.to_string();
    runner
        .run_with_input(
            "cryptsetup",
            &[
                "-q",
                "--cipher",
                cipher,
                "--key-size",
                key_size.as_str(),
                "luksFormat",
                device,
            ],
            passphrase,
        )
        .map(|_| ())
}

/// Read the header UUID back; the mapping name is derived from it.
pub fn luks_uuid(runner: &dyn Runner, device: &str) -> Result<String> {
    let output = runner.run("cryptsetup", &["luksUUID", device])?;
    let uuid = output.stdout.trim().to_string();
    if uuid.is_empty() {
        return Err(SysError::ParseFailed {
            source_name: "cryptsetup luksUUID".to_string(),
            detail: format!("no UUID reported for {device}"),
        });
    }
    Ok(uuid)
}

pub fn luks_open(runner: &dyn Runner, device: &str, name: &str, passphrase: &str) -> Result<()> {
    runner
        .run_with_input("cryptsetup", &["luksOpen", device, name], passphrase)
        .map(|_| ())
}

pub fn luks_close(runner: &dyn Runner, name: &str) -> Result<()> {
    runner.run("cryptsetup", &["luksClose", name]).map(|_| ())
}

/// Check whether a passphrase opens the header without mapping it.
pub fn luks_test_passphrase(runner: &dyn Runner, device: &str, passphrase: &str) -> bool {
    runner
        .run_with_input(
            "cryptsetup",
            &["luksOpen", "--test-passphrase", device],
            passphrase,
        )
        .is_ok()
}

/// Write an escrow packet for the device under `directory`. The packet
/// carries the volume key wrapped with the certificate; when
/// `backup_passphrase` is given it is added as an extra keyslot first.
pub fn write_escrow_packet(
    runner: &dyn Runner,
    device: &str,
    passphrase: &str,
    cert_path: &Path,
    directory: &Path,
    backup_passphrase: Option<&str>,
) -> Result<()> {
    fs::create_dir_all(directory)?;
    if let Some(backup) = backup_passphrase {
        let input = format!("{passphrase}\n{backup}");
        runner.run_with_input("cryptsetup", &["luksAddKey", device], &input)?;
    }
    let cert = cert_path.to_string_lossy();
    let dir = directory.to_string_lossy();
    runner
        .run_with_input(
            "volume_key",
            &["--save", device, "--output", dir.as_ref(), "--certificate", cert.as_ref(), "--batch"],
            passphrase,
        )
        .map(|_| ())
}
