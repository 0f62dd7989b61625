//! Quiesce evaluator
//!
//! Decides whether every other controller in the namespace has finished its
//! work, and names the objects that have not.

use crate::backup::inventory::Inventory;
use crate::crd::BackupSpec;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::fmt;

/// An object whose controller is still working.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HoldUp {
    pub kind: String,
    pub name: String,
}

impl fmt::Display for HoldUp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.name)
    }
}

/// Outcome of a quiesce check. Hold-ups are sorted by kind, then name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuiesceReport {
    pub hold_ups: Vec<HoldUp>,
}

impl QuiesceReport {
    pub fn quiesced(&self) -> bool {
        self.hold_ups.is_empty()
    }

    fn sorted(mut hold_ups: Vec<HoldUp>) -> Self {
        hold_ups.sort();
        Self { hold_ups }
    }
}

impl fmt::Display for QuiesceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.hold_ups.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

fn hold_up(kind: &str, obj: &DynamicObject) -> HoldUp {
    HoldUp {
        kind: kind.to_string(),
        name: obj.name_any(),
    }
}

/// Every object in `inventory` that has not reached a finished state.
pub fn evaluate(inventory: &Inventory) -> QuiesceReport {
    let hold_ups = inventory
        .populated_kinds()
        .flat_map(|(kind, objects)| {
            objects
                .iter()
                .filter(|obj| !kind.is_finished(obj))
                .map(|obj| hold_up(kind.kind, obj))
        })
        .collect();
    QuiesceReport::sorted(hold_ups)
}

/// Every object saved in `bundle` that is missing from `inventory` or has
/// not reached a finished state there yet.
pub fn evaluate_restored(bundle: &BackupSpec, inventory: &Inventory) -> QuiesceReport {
    let mut hold_ups = Vec::new();

    for (kind_name, saved) in &bundle.crs {
        let Some(kind) = crate::backup::kinds::by_kind(kind_name) else {
            continue;
        };
        let live = inventory.objects(kind.kind);
        for obj in &saved.items {
            let name = obj.name_any();
            match live.iter().find(|l| l.name_any() == name) {
                Some(l) if kind.is_finished(l) => {}
                _ => hold_ups.push(hold_up(kind.kind, obj)),
            }
        }
    }

    QuiesceReport::sorted(hold_ups)
}
