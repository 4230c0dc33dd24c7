use serde::{Deserialize, Serialize};
use snapshot::Availability;

/// How an item's stable identifier is derived.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum IdStrategy {
    /// Path of the item link, without query string or fragment.
    #[default]
    Href,
    /// Value of a named attribute on the item element, e.g. `data-sku`.
    Attribute { name: String },
}

/// Selectors and markers used to read items out of a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractRules {
    /// Tried in order; the first selector that yields items wins.
    pub item_selectors: Vec<String>,
    pub id: IdStrategy,
    pub title_selectors: Vec<String>,
    pub price_selectors: Vec<String>,
    pub sold_out_markers: Vec<String>,
    /// When empty, any item without a sold-out marker counts as in stock.
    pub in_stock_markers: Vec<String>,
    pub max_items: usize,
}

impl Default for ExtractRules {
    fn default() -> Self {
        Self {
            item_selectors: vec![
                "a[href*='/p/']".into(),
                "a[href*='-p-']".into(),
                "[data-testid*='goods']".into(),
                ".product-card a".into(),
            ],
            id: IdStrategy::Href,
            title_selectors: vec!["[class*='title']".into(), "[class*='name']".into()],
            price_selectors: vec!["[class*='price']".into()],
            sold_out_markers: vec![
                "sold out".into(),
                "out of stock".into(),
                "notify me".into(),
            ],
            in_stock_markers: Vec::new(),
            max_items: 60,
        }
    }
}

impl ExtractRules {
    pub(crate) fn availability_of(&self, text: &str) -> Availability {
        let lowered = text.to_lowercase();
        let has = |markers: &[String]| {
            markers
                .iter()
                .any(|marker| lowered.contains(&marker.to_lowercase()))
        };

        if has(&self.sold_out_markers) {
            Availability::OutOfStock
        } else if self.in_stock_markers.is_empty() || has(&self.in_stock_markers) {
            Availability::InStock
        } else {
            Availability::Unknown
        }
    }
}
