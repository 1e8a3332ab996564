// SPDX-License-Identifier: GPL-3.0-only

//! Queue pruning
//!
//! Collapses redundant action sequences per device before sorting:
//! create/destroy pairs that cancel out, stale intermediate destroys and
//! creates, superseded resizes, and wasted work before a lone destroy.
//! After pruning, each device has at most one live create, one live
//! destroy, and one resize per object kind.

use std::collections::BTreeSet;

use storage_types::{Action, DeviceId, ObjectKind};

/// Prune `actions` in place, preserving relative order of survivors.
pub fn prune_actions(actions: &mut Vec<Action>) {
    let mut drop: BTreeSet<u64> = BTreeSet::new();
    let device_ids: BTreeSet<DeviceId> = actions.iter().map(|a| a.device).collect();

    for id in device_ids {
        prune_device_objects(actions, id, &mut drop);
        prune_format_objects(actions, id, &mut drop);
        prune_resizes(actions, id, ObjectKind::Device, &mut drop);
        prune_resizes(actions, id, ObjectKind::Format, &mut drop);
        prune_before_lone_destroy(actions, id, &mut drop);
    }

    actions.retain(|a| !drop.contains(&a.serial));
}

fn positions(
    actions: &[Action],
    id: DeviceId,
    pred: impl Fn(&Action) -> bool,
) -> Vec<usize> {
    actions
        .iter()
        .enumerate()
        .filter(|(_, a)| a.device == id && pred(a))
        .map(|(i, _)| i)
        .collect()
}

/// True when the device predates the queue: its earliest action is not a
/// create.
fn preexisting(actions: &[Action], id: DeviceId) -> bool {
    actions
        .iter()
        .find(|a| a.device == id && a.is_device())
        .map(|a| !a.is_create())
        .unwrap_or(true)
}

fn prune_device_objects(actions: &[Action], id: DeviceId, drop: &mut BTreeSet<u64>) {
    let creates = positions(actions, id, |a| a.is_create() && a.is_device());
    let destroys = positions(actions, id, |a| a.is_destroy() && a.is_device());

    if preexisting(actions, id) {
        // Multiple destroys: the device must have been re-created in
        // between; the net effect is the last destroy alone. Everything
        // on this device from the first destroy up to (not including)
        // the last destroy is dead.
        if destroys.len() > 1 {
            let first = destroys[0];
            let last = *destroys.last().unwrap_or_else(|| unreachable!());
            for (i, a) in actions.iter().enumerate() {
                if a.device == id && i >= first && i < last {
                    drop.insert(a.serial);
                }
            }
        } else if creates.len() > 1 {
            // destroy, create, destroy, create: keep the outer pair.
            if let (Some(&first_destroy), Some(&last_create)) =
                (destroys.first(), creates.last())
            {
                for (i, a) in actions.iter().enumerate() {
                    if a.device == id && i > first_destroy && i < last_create {
                        drop.insert(a.serial);
                    }
                }
            } else if let Some(&last_create) = creates.last() {
                for &i in &creates {
                    if i < last_create {
                        drop.insert(actions[i].serial);
                    }
                }
            }
        }
    } else {
        // Created inside the queue. A later destroy cancels the whole
        // history up to it: the device never existed.
        if let Some(&last_destroy) = destroys.last() {
            for (i, a) in actions.iter().enumerate() {
                if a.device == id && i <= last_destroy {
                    drop.insert(a.serial);
                }
            }
        } else if creates.len() > 1 {
            let last = *creates.last().unwrap_or_else(|| unreachable!());
            for &i in &creates {
                if i < last {
                    drop.insert(actions[i].serial);
                }
            }
        }
    }
}

/// Same collapse rules over the device's format slot. The enumeration in
/// the tests below shows which create/destroy interleavings actually
/// occur; windows that cannot arise simply never match.
fn prune_format_objects(actions: &[Action], id: DeviceId, drop: &mut BTreeSet<u64>) {
    let creates = positions(actions, id, |a| a.is_create() && a.is_format());
    let destroys = positions(actions, id, |a| a.is_destroy() && a.is_format());

    let format_preexisting = actions
        .iter()
        .find(|a| a.device == id && a.is_format() && (a.is_create() || a.is_destroy()))
        .map(|a| !a.is_create())
        .unwrap_or(true);

    if format_preexisting {
        if destroys.len() > 1 {
            let first = destroys[0];
            let last = *destroys.last().unwrap_or_else(|| unreachable!());
            for (i, a) in actions.iter().enumerate() {
                if a.device == id && a.is_format() && i >= first && i < last {
                    drop.insert(a.serial);
                }
            }
        } else if creates.len() > 1 {
            if let (Some(&first_destroy), Some(&last_create)) = (destroys.first(), creates.last()) {
                for (i, a) in actions.iter().enumerate() {
                    if a.device == id && a.is_format() && i > first_destroy && i < last_create {
                        drop.insert(a.serial);
                    }
                }
            } else if let Some(&last_create) = creates.last() {
                for &i in &creates {
                    if i < last_create {
                        drop.insert(actions[i].serial);
                    }
                }
            }
        }
    } else if let Some(&last_destroy) = destroys.last() {
        for (i, a) in actions.iter().enumerate() {
            if a.device == id && a.is_format() && i <= last_destroy {
                drop.insert(a.serial);
            }
        }
    } else if creates.len() > 1 {
        let last = *creates.last().unwrap_or_else(|| unreachable!());
        for &i in &creates {
            if i < last {
                drop.insert(actions[i].serial);
            }
        }
    }
}

/// Only the last resize of each (device, object kind) survives.
fn prune_resizes(actions: &[Action], id: DeviceId, object: ObjectKind, drop: &mut BTreeSet<u64>) {
    let resizes = positions(actions, id, |a| a.is_resize() && a.object == object);
    if let Some(&last) = resizes.last() {
        for &i in &resizes {
            if i < last {
                drop.insert(actions[i].serial);
            }
        }
    }
}

/// A preexisting device with exactly one destroy: every resize, format
/// create and migrate queued before the destroy is wasted work.
fn prune_before_lone_destroy(actions: &[Action], id: DeviceId, drop: &mut BTreeSet<u64>) {
    let destroys = positions(actions, id, |a| a.is_destroy() && a.is_device());
    if destroys.len() != 1 || !preexisting(actions, id) {
        return;
    }
    let destroy = destroys[0];
    for (i, a) in actions.iter().enumerate() {
        if a.device != id || i >= destroy {
            continue;
        }
        if a.is_resize() || a.is_migrate() || (a.is_create() && a.is_format()) {
            drop.insert(a.serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::{ActionKind, ResizeDirection};

    fn action(serial: u64, kind: ActionKind, object: ObjectKind, device: DeviceId) -> Action {
        Action {
            serial,
            kind,
            object,
            device,
            format: None,
            new_size: None,
        }
    }

    fn serials(actions: &[Action]) -> Vec<u64> {
        actions.iter().map(|a| a.serial).collect()
    }

    #[test]
    fn transient_device_cancels_out() {
        // create, format, destroy on a device that never existed.
        let mut queue = vec![
            action(1, ActionKind::Create, ObjectKind::Device, 5),
            action(2, ActionKind::Create, ObjectKind::Format, 5),
            action(3, ActionKind::Destroy, ObjectKind::Device, 5),
            action(4, ActionKind::Create, ObjectKind::Device, 6),
        ];
        prune_actions(&mut queue);
        assert_eq!(serials(&queue), vec![4]);
    }

    #[test]
    fn double_destroy_keeps_only_the_last() {
        // destroy, create, destroy on a preexisting device.
        let mut queue = vec![
            action(1, ActionKind::Destroy, ObjectKind::Device, 5),
            action(2, ActionKind::Create, ObjectKind::Device, 5),
            action(3, ActionKind::Destroy, ObjectKind::Device, 5),
        ];
        prune_actions(&mut queue);
        assert_eq!(serials(&queue), vec![3]);
    }

    #[test]
    fn destroy_create_destroy_create_keeps_outer_pair() {
        let mut queue = vec![
            action(1, ActionKind::Destroy, ObjectKind::Device, 5),
            action(2, ActionKind::Create, ObjectKind::Device, 5),
            action(3, ActionKind::Destroy, ObjectKind::Device, 5),
            action(4, ActionKind::Create, ObjectKind::Device, 5),
        ];
        prune_actions(&mut queue);
        // Second destroy dominates the window [first destroy, last destroy),
        // leaving destroy(3) and create(4).
        assert_eq!(serials(&queue), vec![3, 4]);
    }

    #[test]
    fn only_last_resize_survives() {
        let mut queue = vec![
            action(1, ActionKind::Resize(ResizeDirection::Shrink), ObjectKind::Device, 5),
            action(2, ActionKind::Resize(ResizeDirection::Grow), ObjectKind::Device, 5),
            action(3, ActionKind::Resize(ResizeDirection::Grow), ObjectKind::Format, 5),
        ];
        prune_actions(&mut queue);
        assert_eq!(serials(&queue), vec![2, 3]);
    }

    #[test]
    fn wasted_work_before_lone_destroy_is_pruned() {
        let mut queue = vec![
            action(1, ActionKind::Resize(ResizeDirection::Grow), ObjectKind::Device, 5),
            action(2, ActionKind::Create, ObjectKind::Format, 5),
            action(3, ActionKind::Migrate, ObjectKind::Format, 5),
            action(4, ActionKind::Destroy, ObjectKind::Device, 5),
        ];
        prune_actions(&mut queue);
        assert_eq!(serials(&queue), vec![4]);
    }

    #[test]
    fn format_churn_keeps_only_the_last_create() {
        // Reformatting the same partition three times.
        let mut queue = vec![
            action(1, ActionKind::Create, ObjectKind::Format, 5),
            action(2, ActionKind::Create, ObjectKind::Format, 5),
            action(3, ActionKind::Create, ObjectKind::Format, 5),
        ];
        prune_actions(&mut queue);
        assert_eq!(serials(&queue), vec![3]);
    }

    #[test]
    fn format_destroy_then_create_survives_intact() {
        let mut queue = vec![
            action(1, ActionKind::Destroy, ObjectKind::Format, 5),
            action(2, ActionKind::Create, ObjectKind::Format, 5),
        ];
        prune_actions(&mut queue);
        assert_eq!(serials(&queue), vec![1, 2]);
    }

    #[test]
    fn invariants_hold_over_legal_interleavings() {
        // Registration alternates create/destroy for any one device (a
        // second destroy cannot be registered while the device is out of
        // the tree), so the legal sequences are the alternating ones.
        // Enumerate all of them up to length 4 and check the invariants:
        // at most one live create, at most one live destroy.
        for first in [ActionKind::Create, ActionKind::Destroy] {
            for len in 1..=4usize {
                let mut queue: Vec<Action> = (0..len)
                    .map(|i| {
                        let kind = if i % 2 == 0 {
                            first
                        } else if first == ActionKind::Create {
                            ActionKind::Destroy
                        } else {
                            ActionKind::Create
                        };
                        action(i as u64 + 1, kind, ObjectKind::Device, 9)
                    })
                    .collect();
                prune_actions(&mut queue);
                let creates = queue.iter().filter(|a| a.is_create()).count();
                let destroys = queue.iter().filter(|a| a.is_destroy()).count();
                assert!(creates <= 1, "{first:?} len {len}: {creates} creates");
                assert!(destroys <= 1, "{first:?} len {len}: {destroys} destroys");
            }
        }
    }
}
