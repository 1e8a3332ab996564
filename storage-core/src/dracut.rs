// SPDX-License-Identifier: GPL-3.0-only

//! Dracut kernel command line hints
//!
//! The initramfs only assembles the storage it is told about. Every device
//! kind that needs early assembly contributes one token; collecting over a
//! device and its ancestors yields the arguments for a root (or /usr)
//! filesystem on that device.

use std::collections::BTreeSet;

use storage_types::{Device, DeviceExt, DeviceId, DiskVariant};

use crate::tree::DeviceTree;

/// The token this single device contributes, if any.
pub fn dracut_hint(tree: &DeviceTree, device: &Device) -> Option<String> {
    match &device.kind {
        DeviceExt::Luks(ext) => Some(format!("rd.luks.uuid={}", ext.map_name)),
        DeviceExt::LvmLogicalVolume(_) => {
            let vg = device
                .common
                .parents
                .first()
                .and_then(|&id| tree.peek(id))?;
            let lv = device.name().strip_prefix(&format!("{}-", vg.name()))?;
            Some(format!("rd.lvm.lv={}/{}", vg.name(), lv))
        }
        DeviceExt::MdArray(ext) => ext.uuid.as_ref().map(|u| format!("rd.md.uuid={u}")),
        DeviceExt::DmRaidArray(ext) => Some(format!("rd.dm.uuid={}", ext.raid_set)),
        DeviceExt::Disk(ext) => match &ext.variant {
            DiskVariant::Zfcp {
                hba_id,
                wwpn,
                fcp_lun,
            } => Some(format!("rd.zfcp={hba_id},{wwpn},{fcp_lun}")),
            DiskVariant::Dasd { bus_id, opts } => {
                let mut token = format!("rd.dasd={bus_id}");
                for (key, value) in opts {
                    token.push_str(&format!(",{key}={value}"));
                }
                Some(token)
            }
            DiskVariant::Iscsi {
                target,
                address,
                port,
            } => Some(format!("netroot=iscsi:{address}::{port}::{target}")),
            DiskVariant::Fcoe { nic, dcb } => Some(format!(
                "netroot=fcoe:{nic}:{}",
                if *dcb { "dcb" } else { "nodcb" }
            )),
            _ => None,
        },
        _ => None,
    }
}

/// Tokens for booting from `id`: the device's own hint plus every
/// ancestor's, deduplicated and in stable order.
pub fn dracut_setup_args(tree: &DeviceTree, id: DeviceId) -> BTreeSet<String> {
    let mut args = BTreeSet::new();
    let mut ids = tree.ancestors(id);
    ids.push(id);
    for id in ids {
        if let Some(device) = tree.peek(id) {
            if let Some(token) = dracut_hint(tree, device) {
                args.insert(token);
            }
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::{DiskExt, LuksExt, LvExt, MdExt, PartitionExt, VgExt};

    use crate::config::StorageConfig;

    #[test]
    fn encrypted_lvm_root_needs_both_luks_and_lvm_hints() {
        // sda -> sda2 -> luks map -> vg0 -> vg0-root
        let mut tree = DeviceTree::new(StorageConfig::default());

        let sda = Device::new(
            tree.next_device_id(),
            "sda",
            DeviceExt::Disk(DiskExt::default()),
        );
        let sda = tree.add_device(sda);

        let mut part = Device::new(
            tree.next_device_id(),
            "sda2",
            DeviceExt::Partition(PartitionExt::default()),
        );
        part.common.parents = vec![sda];
        let part = tree.add_device(part);

        let mut luks = Device::new(
            tree.next_device_id(),
            "luks-2f2f2f2f",
            DeviceExt::Luks(LuksExt {
                map_name: "luks-2f2f2f2f".to_string(),
            }),
        );
        luks.common.parents = vec![part];
        let luks = tree.add_device(luks);

        let mut vg = Device::new(
            tree.next_device_id(),
            "vg0",
            DeviceExt::LvmVolumeGroup(VgExt::default()),
        );
        vg.common.parents = vec![luks];
        let vg = tree.add_device(vg);

        let mut lv = Device::new(
            tree.next_device_id(),
            "vg0-root",
            DeviceExt::LvmLogicalVolume(LvExt::default()),
        );
        lv.common.parents = vec![vg];
        let lv = tree.add_device(lv);

        let args = dracut_setup_args(&tree, lv);
        assert!(args.contains("rd.luks.uuid=luks-2f2f2f2f"));
        assert!(args.contains("rd.lvm.lv=vg0/root"));
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn md_arrays_hint_by_uuid() {
        let mut tree = DeviceTree::new(StorageConfig::default());
        let md = Device::new(
            tree.next_device_id(),
            "md0",
            DeviceExt::MdArray(MdExt {
                uuid: Some("11111111:2222".to_string()),
                ..MdExt::default()
            }),
        );
        let md = tree.add_device(md);
        let args = dracut_setup_args(&tree, md);
        assert!(args.contains("rd.md.uuid=11111111:2222"));
    }

    #[test]
    fn special_disks_hint_their_transport() {
        let tree = DeviceTree::new(StorageConfig::default());

        let zfcp = Device::new(
            0,
            "sdz",
            DeviceExt::Disk(DiskExt {
                variant: DiskVariant::Zfcp {
                    hba_id: "0.0.fc00".to_string(),
                    wwpn: "0x5005076300c213e9".to_string(),
                    fcp_lun: "0x401040a000000000".to_string(),
                },
                unusable: false,
            }),
        );
        assert_eq!(
            dracut_hint(&tree, &zfcp).as_deref(),
            Some("rd.zfcp=0.0.fc00,0x5005076300c213e9,0x401040a000000000")
        );

        let dasd = Device::new(
            1,
            "dasda",
            DeviceExt::Disk(DiskExt {
                variant: DiskVariant::Dasd {
                    bus_id: "0.0.0100".to_string(),
                    opts: vec![("use_diag".to_string(), "0".to_string())],
                },
                unusable: false,
            }),
        );
        assert_eq!(
            dracut_hint(&tree, &dasd).as_deref(),
            Some("rd.dasd=0.0.0100,use_diag=0")
        );

        let fcoe = Device::new(
            2,
            "sdf",
            DeviceExt::Disk(DiskExt {
                variant: DiskVariant::Fcoe {
                    nic: "eth2".to_string(),
                    dcb: false,
                },
                unusable: false,
            }),
        );
        assert_eq!(dracut_hint(&tree, &fcoe).as_deref(), Some("netroot=fcoe:eth2:nodcb"));

        let plain = Device::new(3, "sda", DeviceExt::Disk(DiskExt::default()));
        assert_eq!(dracut_hint(&tree, &plain), None);
    }
}
