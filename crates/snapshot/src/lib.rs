use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod diff;
mod price;

pub use diff::{diff, plan_events, ChangeEvent, ChangeKind, FirstRunPolicy, NotifyFilter};
pub use price::{parse_price, Price, PriceParseError};

pub const SNAPSHOT_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    OutOfStock,
    #[default]
    Unknown,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Availability::InStock => "in stock",
            Availability::OutOfStock => "out of stock",
            Availability::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Rendered page content handed from the fetcher to the extractor.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// Final URL after redirects; relative links resolve against it.
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

/// One item as observed on a single page load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// `None` when the listing showed no price or the text could not be normalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    #[serde(default)]
    pub availability: Availability,
    pub seen_at: DateTime<Utc>,
}

/// Items observed at one point in time, keyed by identifier.
///
/// Identifiers are unique: the first item inserted under an id wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSet {
    #[serde(default = "schema_version")]
    pub schema_version: i32,
    pub taken_at: DateTime<Utc>,
    items: BTreeMap<String, ItemSnapshot>,
}

fn schema_version() -> i32 {
    SNAPSHOT_SCHEMA_VERSION
}

impl SnapshotSet {
    pub fn new(taken_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            taken_at,
            items: BTreeMap::new(),
        }
    }

    /// Inserts `item` unless its id is already present. Returns whether it was kept.
    pub fn insert(&mut self, item: ItemSnapshot) -> bool {
        match self.items.entry(item.id.clone()) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(item);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ItemSnapshot> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemSnapshot> {
        self.items.values()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

impl FromIterator<ItemSnapshot> for SnapshotSet {
    fn from_iter<I: IntoIterator<Item = ItemSnapshot>>(iter: I) -> Self {
        let mut set = SnapshotSet::new(Utc::now());
        for item in iter {
            set.insert(item);
        }
        set
    }
}
