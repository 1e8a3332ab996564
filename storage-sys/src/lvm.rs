// SPDX-License-Identifier: GPL-3.0-only

//! LVM tool adapter
//!
//! Everything goes through the single `lvm` binary. The device filter is
//! passed explicitly on every invocation instead of living in global
//! state: the tree computes its ignored-device list once and hands it in.

use std::collections::BTreeMap;

use storage_types::Mib;

use crate::run::Runner;
use crate::{Result, SysError};

/// Synthesize an lvm `--config` argument that rejects every ignored
/// device and accepts the rest.
pub fn filter_config(ignored: &[String]) -> Option<String> {
    if ignored.is_empty() {
        return None;
    }
    let rejects: Vec<String> = ignored.iter().map(|d| format!("\"r|^{d}$|\"")).collect();
    Some(format!(
        "devices {{ filter=[{}, \"a/.*/\"] }}",
        rejects.join(", ")
    ))
}

fn lvm_args<'a>(config: &'a Option<String>, args: &[&'a str]) -> Vec<&'a str> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    argv.extend_from_slice(args);
    if let Some(config) = config {
        argv.push("--config");
        argv.push(config.as_str());
    }
    argv
}

#[derive(Debug, Clone, PartialEq)]
pub struct VgReport {
    pub name: String,
    pub uuid: String,
    pub pe_size: Mib,
    pub pe_count: u64,
    pub pe_free: u64,
    pub pv_count: u32,
    pub lv_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LvReport {
    pub vg_name: String,
    pub lv_name: String,
    pub uuid: String,
    pub size: Mib,
    /// Raw lv_attr string; the first character tells mirror images (i/I),
    /// mirror logs (l), and snapshots (s/S) apart from plain volumes.
    pub attr: String,
    pub origin: Option<String>,
}

impl LvReport {
    pub fn is_mirror_image(&self) -> bool {
        matches!(self.attr.chars().next(), Some('i') | Some('I'))
    }

    pub fn is_mirror_log(&self) -> bool {
        self.attr.starts_with('l')
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.attr.chars().next(), Some('s') | Some('S'))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PvReport {
    pub pv_name: String,
    pub uuid: String,
    pub vg_name: Option<String>,
    pub vg_uuid: Option<String>,
    pub pe_start: Mib,
    pub size: Mib,
    pub free: Mib,
}

fn parse_cols(line: &str) -> Vec<String> {
    line.split('\t').map(|part| part.trim().to_string()).collect()
}

fn parse_mib(field: &str) -> Option<Mib> {
    // lvm reports "1024.00" with --units m --nosuffix
    Some(Mib(field.parse::<f64>().ok()? as u64))
}

pub fn parse_vgs(output: &str) -> Vec<VgReport> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_cols(line);
            if cols.len() < 7 {
                return None;
            }
            Some(VgReport {
                name: cols[0].clone(),
                uuid: cols[1].clone(),
                pe_size: parse_mib(&cols[2])?,
                pe_count: cols[3].parse().ok()?,
                pe_free: cols[4].parse().ok()?,
                pv_count: cols[5].parse().ok()?,
                lv_count: cols[6].parse().ok()?,
            })
        })
        .collect()
}

pub fn parse_lvs(output: &str) -> Vec<LvReport> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_cols(line);
            if cols.len() < 5 {
                return None;
            }
            Some(LvReport {
                vg_name: cols[0].clone(),
                lv_name: cols[1].clone(),
                uuid: cols[2].clone(),
                size: parse_mib(&cols[3])?,
                attr: cols[4].clone(),
                origin: cols.get(5).filter(|c| !c.is_empty()).cloned(),
            })
        })
        .collect()
}

pub fn parse_pvs(output: &str) -> Vec<PvReport> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let cols = parse_cols(line);
            if cols.len() < 7 {
                return None;
            }
            Some(PvReport {
                pv_name: cols[0].clone(),
                uuid: cols[1].clone(),
                vg_name: Some(cols[2].clone()).filter(|c| !c.is_empty()),
                vg_uuid: Some(cols[3].clone()).filter(|c| !c.is_empty()),
                pe_start: parse_mib(&cols[4])?,
                size: parse_mib(&cols[5])?,
                free: parse_mib(&cols[6])?,
            })
        })
        .collect()
}

const REPORT_ARGS: &[&str] = &["--noheadings", "--units", "m", "--nosuffix", "--separator", "\t"];

pub fn vgs(runner: &dyn Runner, config: &Option<String>) -> Result<Vec<VgReport>> {
    let mut args = vec!["vgs"];
    args.extend_from_slice(REPORT_ARGS);
    args.extend_from_slice(&[
        "-o",
        "vg_name,vg_uuid,vg_extent_size,vg_extent_count,vg_free_count,pv_count,lv_count",
    ]);
    let output = runner.run("lvm", &lvm_args(config, &args))?;
    Ok(parse_vgs(&output.stdout))
}

pub fn lvs(runner: &dyn Runner, config: &Option<String>) -> Result<Vec<LvReport>> {
    let mut args = vec!["lvs", "-a"];
    args.extend_from_slice(REPORT_ARGS);
    args.extend_from_slice(&["-o", "vg_name,lv_name,lv_uuid,lv_size,lv_attr,origin"]);
    let output = runner.run("lvm", &lvm_args(config, &args))?;
    Ok(parse_lvs(&output.stdout))
}

pub fn pvs(runner: &dyn Runner, config: &Option<String>) -> Result<Vec<PvReport>> {
    let mut args = vec!["pvs"];
    args.extend_from_slice(REPORT_ARGS);
    args.extend_from_slice(&[
        "-o",
        "pv_name,pv_uuid,vg_name,vg_uuid,pe_start,pv_size,pv_free",
    ]);
    let output = runner.run("lvm", &lvm_args(config, &args))?;
    Ok(parse_pvs(&output.stdout))
}

/// Info for one PV. A PV not yet in any VG reports empty VG fields rather
/// than failing.
pub fn pv_info(runner: &dyn Runner, config: &Option<String>, device: &str) -> Result<PvReport> {
    pvs(runner, config)?
        .into_iter()
        .find(|pv| pv.pv_name == device)
        .ok_or_else(|| SysError::DeviceNotFound(device.to_string()))
}

pub fn pv_create(runner: &dyn Runner, config: &Option<String>, device: &str) -> Result<()> {
    runner
        .run("lvm", &lvm_args(config, &["pvcreate", "-ff", "-y", device]))
        .map(|_| ())
}

pub fn pv_remove(runner: &dyn Runner, config: &Option<String>, device: &str) -> Result<()> {
    runner
        .run("lvm", &lvm_args(config, &["pvremove", "-ff", "-y", device]))
        .map(|_| ())
}

pub fn vg_create(
    runner: &dyn Runner,
    config: &Option<String>,
    vg_name: &str,
    pe_size: Mib,
    pv_devices: &[&str],
) -> Result<()> {
    let pe = format!("{}m", pe_size.0);
    let mut args = vec!["vgcreate", "-s", pe.as_str(), vg_name];
    args.extend_from_slice(pv_devices);
    runner.run("lvm", &lvm_args(config, &args)).map(|_| ())
}

pub fn vg_remove(runner: &dyn Runner, config: &Option<String>, vg_name: &str) -> Result<()> {
    runner
        .run("lvm", &lvm_args(config, &["vgremove", "--force", vg_name]))
        .map(|_| ())
}

pub fn vg_activate(runner: &dyn Runner, config: &Option<String>, vg_name: &str) -> Result<()> {
    runner
        .run("lvm", &lvm_args(config, &["vgchange", "-a", "y", vg_name]))
        .map(|_| ())
}

pub fn vg_deactivate(runner: &dyn Runner, config: &Option<String>, vg_name: &str) -> Result<()> {
    runner
        .run("lvm", &lvm_args(config, &["vgchange", "-a", "n", vg_name]))
        .map(|_| ())
}

pub fn vg_reduce(
    runner: &dyn Runner,
    config: &Option<String>,
    vg_name: &str,
    pv_device: &str,
) -> Result<()> {
    runner
        .run(
            "lvm",
            &lvm_args(config, &["vgreduce", "--removemissing", vg_name, pv_device]),
        )
        .map(|_| ())
}

pub fn lv_create(
    runner: &dyn Runner,
    config: &Option<String>,
    vg_name: &str,
    lv_name: &str,
    size: Mib,
) -> Result<()> {
    let size_arg = format!("{}m", size.0);
    runner
        .run(
            "lvm",
            &lvm_args(
                config,
                &["lvcreate", "-L", size_arg.as_str(), "-n", lv_name, vg_name],
            ),
        )
        .map(|_| ())
}

pub fn lv_remove(
    runner: &dyn Runner,
    config: &Option<String>,
    vg_name: &str,
    lv_name: &str,
) -> Result<()> {
    let target = format!("{vg_name}/{lv_name}");
    runner
        .run("lvm", &lvm_args(config, &["lvremove", "--force", target.as_str()]))
        .map(|_| ())
}

pub fn lv_resize(
    runner: &dyn Runner,
    config: &Option<String>,
    vg_name: &str,
    lv_name: &str,
    size: Mib,
) -> Result<()> {
    let target = format!("{vg_name}/{lv_name}");
    let size_arg = format!("{}m", size.0);
    runner
        .run(
            "lvm",
            &lvm_args(
                config,
                &["lvresize", "--force", "-L", size_arg.as_str(), target.as_str()],
            ),
        )
        .map(|_| ())
}

pub fn lv_activate(
    runner: &dyn Runner,
    config: &Option<String>,
    vg_name: &str,
    lv_name: &str,
) -> Result<()> {
    let target = format!("{vg_name}/{lv_name}");
    runner
        .run("lvm", &lvm_args(config, &["lvchange", "-a", "y", target.as_str()]))
        .map(|_| ())
}

pub fn lv_deactivate(
    runner: &dyn Runner,
    config: &Option<String>,
    vg_name: &str,
    lv_name: &str,
) -> Result<()> {
    let target = format!("{vg_name}/{lv_name}");
    runner
        .run("lvm", &lvm_args(config, &["lvchange", "-a", "n", target.as_str()]))
        .map(|_| ())
}

/// Group LV reports by VG for tree population.
pub fn lvs_by_vg(reports: Vec<LvReport>) -> BTreeMap<String, Vec<LvReport>> {
    let mut map: BTreeMap<String, Vec<LvReport>> = BTreeMap::new();
    for lv in reports {
        map.entry(lv.vg_name.clone()).or_default().push(lv);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ScriptedRunner;

    #[test]
    fn parses_vgs_report() {
        let vgs = parse_vgs("  vg0\tAbCdEf-1234\t4.00\t1000\t250\t2\t3\n");
        assert_eq!(vgs.len(), 1);
        assert_eq!(vgs[0].name, "vg0");
        assert_eq!(vgs[0].pe_size, Mib(4));
        assert_eq!(vgs[0].pe_count, 1000);
        assert_eq!(vgs[0].pe_free, 250);
        assert_eq!(vgs[0].pv_count, 2);
    }

    #[test]
    fn parses_lvs_attr_classes() {
        let lvs = parse_lvs(
            "  vg0\troot\tuuid1\t8192.00\t-wi-ao----\t\n  vg0\tsnap\tuuid2\t1024.00\tswi-a-s---\troot\n  vg0\t[root_mimage_0]\tuuid3\t8192.00\tiwi-ao----\t\n  vg0\t[root_mlog]\tuuid4\t4.00\tlwi-ao----\t\n",
        );
        assert_eq!(lvs.len(), 4);
        assert!(!lvs[0].is_snapshot());
        assert!(lvs[1].is_snapshot());
        assert_eq!(lvs[1].origin.as_deref(), Some("root"));
        assert!(lvs[2].is_mirror_image());
        assert!(lvs[3].is_mirror_log());
    }

    #[test]
    fn parses_pvs_with_and_without_vg() {
        let pvs = parse_pvs(
            "  /dev/sda2\tpv-uuid-1\tvg0\tvg-uuid-1\t1.00\t102400.00\t0.00\n  /dev/sdb2\tpv-uuid-2\t\t\t1.00\t102400.00\t102400.00\n",
        );
        assert_eq!(pvs.len(), 2);
        assert_eq!(pvs[0].vg_name.as_deref(), Some("vg0"));
        assert_eq!(pvs[1].vg_name, None);
        assert_eq!(pvs[1].vg_uuid, None);
        assert_eq!(pvs[1].pe_start, Mib(1));
    }

    #[test]
    fn filter_config_rejects_ignored_devices() {
        assert_eq!(filter_config(&[]), None);
        let config = filter_config(&["/dev/sdc".to_string(), "/dev/sdd".to_string()]).unwrap();
        assert!(config.contains("\"r|^/dev/sdc$|\""));
        assert!(config.contains("\"r|^/dev/sdd$|\""));
        assert!(config.ends_with("\"a/.*/\"] }"));
    }

    #[test]
    fn invocations_carry_the_filter() {
        let runner = ScriptedRunner::new();
        let config = filter_config(&["/dev/sdz".to_string()]);
        pv_create(&runner, &config, "/dev/sda2").unwrap();
        assert!(runner.saw("lvm", &["pvcreate", "/dev/sda2", "--config"]));
    }

    #[test]
    fn lv_targets_are_vg_slash_lv() {
        let runner = ScriptedRunner::new();
        lv_remove(&runner, &None, "vg0", "root").unwrap();
        assert!(runner.saw("lvm", &["lvremove", "--force", "vg0/root"]));
    }
}
