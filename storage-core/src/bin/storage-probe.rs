// SPDX-License-Identifier: GPL-3.0-only

//! Probe the host's block devices and print the resulting device tree.
//!
//! Reads the same sources the engine uses during an install (udev db,
//! sysfs, disklabels, lvm and mdadm reports) without modifying anything,
//! and dumps the modelled tree as JSON. Needs root for the disklabel reads.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use storage_core::{populate, DeviceTree, ProbeSnapshot, StorageConfig};
use storage_sys::SystemRunner;

#[derive(Parser, Debug)]
#[command(name = "storage-probe", about = "Dump the modelled storage device tree")]
struct Args {
    /// Disks to leave out of the model entirely.
    #[arg(long = "ignore", value_name = "DISK")]
    ignored_disks: Vec<String>,

    /// When given, only these disks are modelled.
    #[arg(long = "only", value_name = "DISK")]
    exclusive_disks: Vec<String>,

    /// Device specs (UUID=, LABEL=, /dev/...) that must never be modified.
    #[arg(long = "protect", value_name = "SPEC")]
    protected_specs: Vec<String>,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storage_core=info,storage_sys=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("storage-probe must run as root to read disklabels");
    }

    let args = Args::parse();
    let config = StorageConfig {
        ignored_disks: args.ignored_disks,
        exclusive_disks: args.exclusive_disks,
        protected_specs: args.protected_specs,
        ..StorageConfig::default()
    };

    let runner = SystemRunner::new();
    let mut tree = DeviceTree::new(config);
    let snapshot = ProbeSnapshot::gather(&runner, &[])?;
    populate(&mut tree, &snapshot, &runner)?;

    let devices: Vec<_> = tree.devices().collect();
    let json = if args.pretty {
        serde_json::to_string_pretty(&devices)?
    } else {
        serde_json::to_string(&devices)?
    };
    println!("{json}");
    Ok(())
}
