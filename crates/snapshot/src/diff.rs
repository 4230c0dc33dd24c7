use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{Availability, ItemSnapshot, Price, SnapshotSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    PriceChanged,
    AvailabilityChanged,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 4] = [
        ChangeKind::Added,
        ChangeKind::Removed,
        ChangeKind::PriceChanged,
        ChangeKind::AvailabilityChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::PriceChanged => "price_changed",
            ChangeKind::AvailabilityChanged => "availability_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Added {
        item: ItemSnapshot,
    },
    Removed {
        item: ItemSnapshot,
    },
    PriceChanged {
        id: String,
        old: Option<Price>,
        new: Option<Price>,
    },
    AvailabilityChanged {
        id: String,
        old: Availability,
        new: Availability,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Added { .. } => ChangeKind::Added,
            ChangeEvent::Removed { .. } => ChangeKind::Removed,
            ChangeEvent::PriceChanged { .. } => ChangeKind::PriceChanged,
            ChangeEvent::AvailabilityChanged { .. } => ChangeKind::AvailabilityChanged,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Added { item } | ChangeEvent::Removed { item } => &item.id,
            ChangeEvent::PriceChanged { id, .. } | ChangeEvent::AvailabilityChanged { id, .. } => id,
        }
    }
}

/// Compares two snapshot sets item by item.
///
/// Events come out ordered by item id; an item present on both sides yields at
/// most one event per changed field (price, then availability).
pub fn diff(previous: &SnapshotSet, current: &SnapshotSet) -> Vec<ChangeEvent> {
    let ids: BTreeSet<&str> = previous.ids().chain(current.ids()).collect();
    let mut events = Vec::new();

    for id in ids {
        match (previous.get(id), current.get(id)) {
            (None, Some(item)) => events.push(ChangeEvent::Added { item: item.clone() }),
            (Some(item), None) => events.push(ChangeEvent::Removed { item: item.clone() }),
            (Some(old), Some(new)) => {
                if price_changed(old.price.as_ref(), new.price.as_ref()) {
                    events.push(ChangeEvent::PriceChanged {
                        id: id.to_string(),
                        old: old.price.clone(),
                        new: new.price.clone(),
                    });
                }
                if old.availability != new.availability {
                    events.push(ChangeEvent::AvailabilityChanged {
                        id: id.to_string(),
                        old: old.availability,
                        new: new.availability,
                    });
                }
            }
            (None, None) => {}
        }
    }

    events
}

fn price_changed(old: Option<&Price>, new: Option<&Price>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => !old.same_amount(new),
        (None, None) => false,
        _ => true,
    }
}

/// What to do when a target has never had a baseline committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstRunPolicy {
    /// Establish the baseline silently.
    #[default]
    Suppress,
    /// Report every discovered item as added.
    EmitAdded,
}

/// Diffs `current` against the committed baseline, applying `policy` when
/// there is none yet.
pub fn plan_events(
    baseline: Option<&SnapshotSet>,
    current: &SnapshotSet,
    policy: FirstRunPolicy,
) -> Vec<ChangeEvent> {
    match (baseline, policy) {
        (Some(previous), _) => diff(previous, current),
        (None, FirstRunPolicy::Suppress) => Vec::new(),
        (None, FirstRunPolicy::EmitAdded) => diff(&SnapshotSet::new(Utc::now()), current),
    }
}

/// The change kinds that are worth a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotifyFilter(HashSet<ChangeKind>);

impl Default for NotifyFilter {
    fn default() -> Self {
        Self(ChangeKind::ALL.into_iter().collect())
    }
}

impl NotifyFilter {
    pub fn allows(&self, kind: ChangeKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn select<'a>(&self, events: &'a [ChangeEvent]) -> Vec<&'a ChangeEvent> {
        events.iter().filter(|event| self.allows(event.kind())).collect()
    }
}
