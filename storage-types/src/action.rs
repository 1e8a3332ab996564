// SPDX-License-Identifier: GPL-3.0-only

//! Pending modifications to the device tree
//!
//! Actions are plain records; the tree interprets them on registration and
//! the executor carries them out. Ordering and pruning live in
//! storage-core, next to the tree.

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::format::Format;
use crate::size::Mib;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeDirection {
    Grow,
    Shrink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Destroy,
    Resize(ResizeDirection),
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Device,
    Format,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Registration serial; later registrations get higher serials, which
    /// makes the execution sort stable.
    pub serial: u64,
    pub kind: ActionKind,
    pub object: ObjectKind,
    pub device: DeviceId,
    /// The format being created/destroyed/resized, for format actions.
    pub format: Option<Format>,
    pub new_size: Option<Mib>,
}

impl Action {
    pub fn is_create(&self) -> bool {
        self.kind == ActionKind::Create
    }

    pub fn is_destroy(&self) -> bool {
        self.kind == ActionKind::Destroy
    }

    pub fn is_resize(&self) -> bool {
        matches!(self.kind, ActionKind::Resize(_))
    }

    pub fn is_migrate(&self) -> bool {
        self.kind == ActionKind::Migrate
    }

    pub fn is_grow(&self) -> bool {
        self.kind == ActionKind::Resize(ResizeDirection::Grow)
    }

    pub fn is_shrink(&self) -> bool {
        self.kind == ActionKind::Resize(ResizeDirection::Shrink)
    }

    pub fn is_device(&self) -> bool {
        self.object == ObjectKind::Device
    }

    pub fn is_format(&self) -> bool {
        self.object == ObjectKind::Format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_kind_and_object() {
        let action = Action {
            serial: 1,
            kind: ActionKind::Resize(ResizeDirection::Grow),
            object: ObjectKind::Device,
            device: 7,
            format: None,
            new_size: Some(Mib(2048)),
        };
        assert!(action.is_resize());
        assert!(action.is_grow());
        assert!(!action.is_shrink());
        assert!(action.is_device());
        assert!(!action.is_format());
        assert!(!action.is_create());
    }
}
