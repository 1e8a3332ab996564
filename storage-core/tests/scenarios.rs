// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end scenarios: probe snapshot in, executed tool calls out.
//!
//! Everything runs against an in-memory disklabel store and a scripted
//! runner that records argv vectors, so the full pipeline (populate,
//! request allocation, registration, prune, sort, execute) is exercised
//! without touching the host.

use storage_core::actions::{prune_actions, sort_actions};
use storage_core::dracut::dracut_setup_args;
use storage_core::platform::X86;
use storage_core::{
    allocate_partitions, populate, process_actions, DeviceTree, MemoryDiskIo, NullProgress,
    ProbeSnapshot, StorageConfig,
};
use storage_core::populate::{PartitionInfo, ProbedDevice};
use storage_sys::disklabel::DiskLabelIo;
use storage_sys::lvm::{LvReport, PvReport, VgReport};
use storage_sys::udev::UdevInfo;
use storage_sys::ScriptedRunner;
use storage_types::{
    get_format, Action, ActionKind, Device, DeviceExt, DeviceId, DiskExt, DiskLabelType,
    FormatArgs, FsType, LuksExt, LvExt, Mib, ObjectKind, PartGeometry, PartType, PartitionExt,
    PartitionRequest, VgExt,
};

fn probed_disk(name: &str, size: Mib, label: Option<&str>) -> ProbedDevice {
    ProbedDevice {
        info: UdevInfo {
            name: name.to_string(),
            serial_short: Some(format!("serial-{name}")),
            ..UdevInfo::default()
        },
        size,
        sysfs_path: format!("/sys/class/block/{name}"),
        disklabel: label.map(str::to_string),
        ..ProbedDevice::default()
    }
}

fn empty_msdos(size: Mib) -> DiskLabelIo {
    DiskLabelIo {
        label_type: DiskLabelType::Msdos,
        disk_sectors: size.to_sectors(),
        disk_guid: None,
        partitions: Vec::new(),
    }
}

fn labeled_disk(tree: &mut DeviceTree, name: &str, size: Mib) -> DeviceId {
    let mut device = Device::new(
        tree.next_device_id(),
        name,
        DeviceExt::Disk(DiskExt::default()),
    );
    device.common.exists = true;
    device.common.size = size;
    device.common.format = Some(get_format(
        "msdos",
        FormatArgs {
            exists: true,
            ..FormatArgs::default()
        },
    ));
    tree.add_device(device)
}

fn existing_partition(tree: &mut DeviceTree, name: &str, disk: DeviceId, number: u32) -> DeviceId {
    let mut device = Device::new(
        tree.next_device_id(),
        name,
        DeviceExt::Partition(PartitionExt {
            number: Some(number),
            geometry: Some(PartGeometry {
                start: 2048,
                length: Mib(1000).to_sectors(),
            }),
            ..PartitionExt::default()
        }),
    );
    device.common.parents = vec![disk];
    device.common.exists = true;
    device.common.size = Mib(1000);
    tree.add_device(device)
}

fn sorted_queue(tree: &DeviceTree) -> Vec<Action> {
    let mut queue = tree.actions().to_vec();
    prune_actions(&mut queue);
    sort_actions(&mut queue, tree);
    queue
}

fn describe(tree: &DeviceTree, action: &Action) -> (ActionKind, ObjectKind, String) {
    let name = tree
        .peek(action.device)
        .map(|d| d.name().to_string())
        .unwrap_or_default();
    (action.kind, action.object, name)
}

#[test]
fn two_disk_msdos_layout_with_boot_root_and_swap() {
    // Both disks empty; the install targets sda.
    let snapshot = ProbeSnapshot {
        devices: vec![
            probed_disk("sda", Mib(10_000), Some("msdos")),
            probed_disk("sdb", Mib(10_000), Some("msdos")),
        ],
        ..ProbeSnapshot::default()
    };
    let mut tree = DeviceTree::new(StorageConfig::default());
    let runner = ScriptedRunner::new();
    populate(&mut tree, &snapshot, &runner).unwrap();

    let requests = vec![
        PartitionRequest::new(Some("/boot"), FsType::Ext4, Mib(500))
            .primary()
            .bootable()
            .weight(2000)
            .on_disks(&["sda"]),
        PartitionRequest::new(Some("/"), FsType::Ext4, Mib(1024))
            .grow(None)
            .on_disks(&["sda"]),
        PartitionRequest::new(None, FsType::Swap, Mib(2000))
            .weight(-1)
            .on_disks(&["sda"]),
    ];
    allocate_partitions(&mut tree, &X86, &requests).unwrap();

    let described: Vec<_> = sorted_queue(&tree)
        .iter()
        .map(|a| describe(&tree, a))
        .collect();
    assert_eq!(
        described,
        vec![
            (ActionKind::Create, ObjectKind::Device, "sda1".to_string()),
            (ActionKind::Create, ObjectKind::Format, "sda1".to_string()),
            (ActionKind::Create, ObjectKind::Device, "sda2".to_string()),
            (ActionKind::Create, ObjectKind::Format, "sda2".to_string()),
            (ActionKind::Create, ObjectKind::Device, "sda3".to_string()),
            (ActionKind::Create, ObjectKind::Format, "sda3".to_string()),
        ]
    );

    let disk_io = MemoryDiskIo::new();
    disk_io.set_label("/dev/sda", empty_msdos(Mib(10_000)));
    let runner = ScriptedRunner::new();
    process_actions(&mut tree, &runner, &disk_io, &mut NullProgress).unwrap();

    let label = disk_io.label("/dev/sda").unwrap();
    assert_eq!(label.partitions.len(), 3);
    assert!(runner.saw("mkfs.ext4", &["/dev/sda1"]));
    assert!(runner.saw("mkfs.ext4", &["/dev/sda2"]));
    assert!(runner.saw("mkswap", &["/dev/sda3"]));

    let mountpoints = tree.mountpoints();
    assert_eq!(
        tree.get(mountpoints["/boot"]).unwrap().name(),
        "sda1"
    );
    assert_eq!(tree.get(mountpoints["/"]).unwrap().name(), "sda2");
    let swaps = tree.swaps();
    assert_eq!(swaps.len(), 1);
    assert_eq!(swaps[0].name(), "sda3");

    // Root grew into everything the fixed requests left behind.
    let root = tree.get(mountpoints["/"]).unwrap();
    assert_eq!(root.size(), Mib(10_000) - Mib(500) - Mib(2000) - Mib(1));
}

#[test]
fn luks_encrypted_lvm_root() {
    let mut tree = DeviceTree::new(StorageConfig::default());
    let sda = labeled_disk(&mut tree, "sda", Mib(10_000));

    // /boot partition.
    let mut sda1 = Device::new(
        tree.next_device_id(),
        "sda1",
        DeviceExt::Partition(PartitionExt {
            part_type: PartType::Primary,
            number: Some(1),
            geometry: Some(PartGeometry {
                start: 2048,
                length: Mib(500).to_sectors(),
            }),
            ..PartitionExt::default()
        }),
    );
    sda1.common.parents = vec![sda];
    sda1.common.size = Mib(500);
    tree.register_create_device(sda1).unwrap();
    let sda1 = tree.get_by_name("sda1").unwrap().id;
    tree.register_create_format(
        sda1,
        get_format(
            "ext4",
            FormatArgs {
                mountpoint: Some("/boot".to_string()),
                ..FormatArgs::default()
            },
        ),
    )
    .unwrap();

    // The rest of the disk, encrypted.
    let mut sda2 = Device::new(
        tree.next_device_id(),
        "sda2",
        DeviceExt::Partition(PartitionExt {
            part_type: PartType::Primary,
            number: Some(2),
            geometry: Some(PartGeometry {
                start: 2048 + Mib(500).to_sectors(),
                length: Mib(9_400).to_sectors(),
            }),
            ..PartitionExt::default()
        }),
    );
    sda2.common.parents = vec![sda];
    sda2.common.size = Mib(9_400);
    tree.register_create_device(sda2).unwrap();
    let sda2 = tree.get_by_name("sda2").unwrap().id;
    tree.register_create_format(
        sda2,
        get_format(
            "luks",
            FormatArgs {
                passphrase: Some("secret".to_string()),
                ..FormatArgs::default()
            },
        ),
    )
    .unwrap();

    // Planned mapping; it is renamed once the header uuid exists.
    let mut mapping = Device::new(
        tree.next_device_id(),
        "luks-temp",
        DeviceExt::Luks(LuksExt {
            map_name: "luks-temp".to_string(),
        }),
    );
    mapping.common.parents = vec![sda2];
    mapping.common.size = Mib(9_398);
    tree.register_create_device(mapping).unwrap();
    let mapping = tree.get_by_name("luks-temp").unwrap().id;
    tree.register_create_format(mapping, get_format("lvmpv", FormatArgs::default()))
        .unwrap();

    let mut vg = Device::new(
        tree.next_device_id(),
        "vg0",
        DeviceExt::LvmVolumeGroup(VgExt::default()),
    );
    vg.common.parents = vec![mapping];
    vg.common.size = Mib(9_396);
    tree.register_create_device(vg).unwrap();
    let vg = tree.get_by_name("vg0").unwrap().id;

    for (lv, size, format) in [
        ("vg0-root", Mib(7_000), ("ext4", Some("/"))),
        ("vg0-swap", Mib(2_000), ("swap", None)),
    ] {
        let mut device = Device::new(
            tree.next_device_id(),
            lv,
            DeviceExt::LvmLogicalVolume(LvExt::default()),
        );
        device.common.parents = vec![vg];
        device.common.size = size;
        tree.register_create_device(device).unwrap();
        let id = tree.get_by_name(lv).unwrap().id;
        tree.register_create_format(
            id,
            get_format(
                format.0,
                FormatArgs {
                    mountpoint: format.1.map(str::to_string),
                    ..FormatArgs::default()
                },
            ),
        )
        .unwrap();
    }

    let runner = ScriptedRunner::new();
    let uuid = "2f2f2f2f-aaaa-bbbb-cccc-111122223333";
    // Calls up to the header uuid readback; everything after succeeds empty.
    runner.expect("udevadm", "");
    runner.expect("mkfs.ext4", "");
    runner.expect("udevadm", "");
    runner.expect("udevadm", "");
    runner.expect("cryptsetup", "");
    runner.expect("cryptsetup", &format!("{uuid}\n"));

    let disk_io = MemoryDiskIo::new();
    disk_io.set_label("/dev/sda", empty_msdos(Mib(10_000)));
    process_actions(&mut tree, &runner, &disk_io, &mut NullProgress).unwrap();

    // sda -> sda1(/boot) and sda -> sda2 -> luks-<uuid> -> vg0 -> LVs.
    let map_name = format!("luks-{uuid}");
    let mapping = tree.get_by_name(&map_name).expect("mapping renamed");
    assert_eq!(mapping.common.parents, vec![sda2]);
    assert_eq!(
        tree.get(sda2).unwrap().format().unwrap().common.uuid.as_deref(),
        Some(uuid)
    );
    let vg_device = tree.get(vg).unwrap();
    assert_eq!(vg_device.common.parents, vec![mapping.id]);

    assert!(runner.saw("cryptsetup", &["luksFormat", "/dev/sda2"]));
    assert!(runner.saw("cryptsetup", &["luksOpen", "/dev/sda2", &map_name]));
    assert!(runner.saw("lvm", &["pvcreate", &format!("/dev/mapper/{map_name}")]));
    assert!(runner.saw("lvm", &["vgcreate", "vg0"]));
    assert!(runner.saw("lvm", &["lvcreate", "-n", "root", "vg0"]));
    assert!(runner.saw("mkswap", &["/dev/mapper/vg0-swap"]));

    let mountpoints = tree.mountpoints();
    assert_eq!(tree.get(mountpoints["/boot"]).unwrap().name(), "sda1");
    let root = tree.get(mountpoints["/"]).unwrap();
    assert_eq!(root.name(), "vg0-root");

    let hints = dracut_setup_args(&tree, root.id);
    assert!(hints.contains(&format!("rd.luks.uuid={map_name}")));
    assert!(hints.contains("rd.lvm.lv=vg0/root"));
}

#[test]
fn destroying_a_vg_frees_its_disks_for_reuse() {
    let mut tree = DeviceTree::new(StorageConfig::default());
    let sda = labeled_disk(&mut tree, "sda", Mib(10_000));
    let sdb = labeled_disk(&mut tree, "sdb", Mib(10_000));
    let sda5 = existing_partition(&mut tree, "sda5", sda, 5);
    let sdb5 = existing_partition(&mut tree, "sdb5", sdb, 5);
    for id in [sda5, sdb5] {
        let path = tree.get(id).unwrap().path();
        tree.get_mut(id).unwrap().common.format = Some(get_format(
            "LVM2_member",
            FormatArgs {
                device: Some(path),
                exists: true,
                ..FormatArgs::default()
            },
        ));
    }

    let mut vg = Device::new(
        tree.next_device_id(),
        "vg0",
        DeviceExt::LvmVolumeGroup(VgExt::default()),
    );
    vg.common.parents = vec![sda5, sdb5];
    vg.common.exists = true;
    vg.common.size = Mib(1_990);
    let vg = tree.add_device(vg);

    let mut lvs = Vec::new();
    for name in ["vg0-root", "vg0-home"] {
        let mut lv = Device::new(
            tree.next_device_id(),
            name,
            DeviceExt::LvmLogicalVolume(LvExt::default()),
        );
        lv.common.parents = vec![vg];
        lv.common.exists = true;
        lv.common.size = Mib(900);
        lvs.push(tree.add_device(lv));
    }

    // Queue the teardown in a deliberately awkward order, then the reuse.
    tree.register_destroy_device(lvs[1]).unwrap();
    tree.register_destroy_device(lvs[0]).unwrap();
    tree.register_destroy_device(vg).unwrap();
    tree.register_destroy_format(sda5).unwrap();
    tree.register_destroy_format(sdb5).unwrap();
    tree.register_destroy_device(sda5).unwrap();
    tree.register_destroy_device(sdb5).unwrap();

    let mut new_part = Device::new(
        tree.next_device_id(),
        "sda5",
        DeviceExt::Partition(PartitionExt {
            number: Some(5),
            geometry: Some(PartGeometry {
                start: 2048,
                length: Mib(1000).to_sectors(),
            }),
            ..PartitionExt::default()
        }),
    );
    new_part.common.parents = vec![sda];
    new_part.common.size = Mib(1000);
    tree.register_create_device(new_part).unwrap();
    let new_id = tree.get_by_name("sda5").unwrap().id;
    tree.register_create_format(
        new_id,
        get_format(
            "ext4",
            FormatArgs {
                mountpoint: Some("/".to_string()),
                ..FormatArgs::default()
            },
        ),
    )
    .unwrap();

    let queue = sorted_queue(&tree);
    let position = |kind: ActionKind, object: ObjectKind, device: DeviceId| {
        queue
            .iter()
            .position(|a| a.kind == kind && a.object == object && a.device == device)
            .unwrap_or_else(|| panic!("missing {kind:?} {object:?} on {device}"))
    };

    let d = ActionKind::Destroy;
    let c = ActionKind::Create;
    let dev = ObjectKind::Device;
    let fmt = ObjectKind::Format;

    // LVs, then the VG, then the PV formats, then the partitions.
    for lv in [lvs[0], lvs[1]] {
        assert!(position(d, dev, lv) < position(d, dev, vg));
    }
    for pv in [sda5, sdb5] {
        assert!(position(d, dev, vg) < position(d, fmt, pv));
        assert!(position(d, fmt, pv) < position(d, dev, pv));
    }
    // Every destroy precedes the reuse; device create precedes its format.
    assert!(position(d, dev, sda5) < position(c, dev, new_id));
    assert!(position(d, dev, sdb5) < position(c, dev, new_id));
    assert!(position(c, dev, new_id) < position(c, fmt, new_id));
}

#[test]
fn inconsistent_vg_is_dropped_without_prompting_when_zero_mbr_is_set() {
    let mut pv = ProbedDevice {
        info: UdevInfo {
            name: "sda2".to_string(),
            devtype: Some("partition".to_string()),
            fs_type: Some("LVM2_member".to_string()),
            fs_uuid: Some("pv-uuid-1".to_string()),
            ..UdevInfo::default()
        },
        size: Mib(4_000),
        sysfs_path: "/sys/class/block/sda/sda2".to_string(),
        ..ProbedDevice::default()
    };
    pv.partition = Some(PartitionInfo {
        disk: "sda".to_string(),
        number: 2,
        part_type: PartType::Primary,
        start: 2048,
        length: Mib(4_000).to_sectors(),
        bootable: false,
    });

    let snapshot = ProbeSnapshot {
        devices: vec![probed_disk("sda", Mib(10_000), Some("msdos")), pv],
        vgs: vec![VgReport {
            name: "vg0".to_string(),
            uuid: "vg-uuid-1".to_string(),
            pe_size: Mib(4),
            pe_count: 1000,
            pe_free: 0,
            pv_count: 2, // on-disk metadata claims a second PV
            lv_count: 1,
        }],
        lvs: vec![LvReport {
            vg_name: "vg0".to_string(),
            lv_name: "root".to_string(),
            uuid: "lv-uuid-1".to_string(),
            size: Mib(3_000),
            attr: "-wi-ao----".to_string(),
            origin: None,
        }],
        pvs: vec![PvReport {
            pv_name: "/dev/sda2".to_string(),
            uuid: "pv-uuid-1".to_string(),
            vg_name: Some("vg0".to_string()),
            vg_uuid: Some("vg-uuid-1".to_string()),
            pe_start: Mib(1),
            size: Mib(4_000),
            free: Mib(0),
        }],
        ..ProbeSnapshot::default()
    };

    let mut config = StorageConfig::default();
    config.zero_mbr = true;
    let mut tree = DeviceTree::new(config);
    let runner = ScriptedRunner::new();
    populate(&mut tree, &snapshot, &runner).unwrap();

    assert!(tree.get_by_name("vg0").is_none());
    assert!(tree.get_by_name("vg0-root").is_none());
    let survivor = tree.get_by_name("sda2").unwrap();
    assert_eq!(survivor.format().unwrap().type_name(), "unknown");
}

#[test]
fn multipath_pair_collapses_but_card_readers_do_not() {
    let mpath_member = |name: &str| ProbedDevice {
        info: UdevInfo {
            name: name.to_string(),
            serial_short: Some("S1".to_string()),
            ..UdevInfo::default()
        },
        size: Mib(10_000),
        sysfs_path: format!("/sys/class/block/{name}"),
        ..ProbedDevice::default()
    };
    let card_reader = |name: &str| ProbedDevice {
        info: UdevInfo {
            name: name.to_string(),
            serial_short: Some("S3".to_string()),
            usb_driver: Some("usb-storage".to_string()),
            ..UdevInfo::default()
        },
        size: Mib(100),
        sysfs_path: format!("/sys/class/block/{name}"),
        ..ProbedDevice::default()
    };

    let snapshot = ProbeSnapshot {
        devices: vec![
            mpath_member("sda"),
            mpath_member("sdc"),
            card_reader("sde"),
            card_reader("sdf"),
        ],
        ..ProbeSnapshot::default()
    };
    let mut tree = DeviceTree::new(StorageConfig::default());
    let runner = ScriptedRunner::new();
    populate(&mut tree, &snapshot, &runner).unwrap();

    let mpath = tree.get_by_name("mpatha").expect("multipath built");
    let mut members: Vec<&str> = mpath
        .common
        .parents
        .iter()
        .map(|&id| tree.get(id).unwrap().name())
        .collect();
    members.sort_unstable();
    assert_eq!(members, vec!["sda", "sdc"]);
    for member in ["sda", "sdc"] {
        let device = tree.get_by_name(member).unwrap();
        assert_eq!(device.format().unwrap().type_name(), "multipath_member");
    }

    // The card-reader pair keeps its two independent disks.
    assert!(tree.get_by_name("sde").is_some());
    assert!(tree.get_by_name("sdf").is_some());
    assert!(tree.get_by_name("mpathb").is_none());
}
