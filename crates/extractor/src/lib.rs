use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use snapshot::{parse_price, ItemSnapshot, Price, RawPage, SnapshotSet};
use thiserror::Error;
use tracing::{debug, warn};

mod rules;

pub use rules::{ExtractRules, IdStrategy};

const TITLE_FALLBACK_CHARS: usize = 60;
const PRICE_HINTS: &[&str] = &["₹", "Rs.", "Rs ", "US$", "$", "€", "£", "INR", "USD", "EUR", "GBP"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
    /// Nothing matched on a page that should list items; usually a layout change.
    #[error("no items recovered from {url} (tried {tried:?})")]
    Empty { url: String, tried: Vec<String> },
}

#[derive(Debug, Error)]
enum ItemProblem {
    #[error("no usable href")]
    MissingHref,
    #[error("missing id attribute `{0}`")]
    MissingAttribute(String),
    #[error("identifier is empty")]
    EmptyId,
}

/// Compiled form of [`ExtractRules`].
pub struct Extractor {
    items: Vec<(String, Selector)>,
    titles: Vec<Selector>,
    prices: Vec<Selector>,
    anchor: Selector,
    rules: ExtractRules,
    default_currency: Option<String>,
    expect_items: bool,
}

impl Extractor {
    pub fn new(rules: ExtractRules) -> Result<Self, ExtractError> {
        let items = rules
            .item_selectors
            .iter()
            .map(|raw| compile(raw).map(|selector| (raw.clone(), selector)))
            .collect::<Result<Vec<_>, _>>()?;
        let titles = compile_all(&rules.title_selectors)?;
        let prices = compile_all(&rules.price_selectors)?;
        Ok(Self {
            items,
            titles,
            prices,
            anchor: compile("a[href]")?,
            rules,
            default_currency: None,
            expect_items: true,
        })
    }

    pub fn with_default_currency(mut self, currency: Option<String>) -> Self {
        self.default_currency = currency;
        self
    }

    /// Whether a page with zero items is an error. Defaults to `true`.
    pub fn expect_items(mut self, expect: bool) -> Self {
        self.expect_items = expect;
        self
    }

    pub fn extract(&self, page: &RawPage) -> Result<SnapshotSet, ExtractError> {
        let document = Html::parse_document(&page.html);

        for (raw, selector) in &self.items {
            let mut set = SnapshotSet::new(page.fetched_at);
            for element in document.select(selector) {
                if set.len() >= self.rules.max_items {
                    break;
                }
                match self.item_from(element, page) {
                    Ok(item) => {
                        let id = item.id.clone();
                        if !set.insert(item) {
                            debug!(selector = %raw, %id, "duplicate item skipped");
                        }
                    }
                    Err(problem) => {
                        warn!(selector = %raw, url = %page.url, reason = %problem, "skipping malformed item")
                    }
                }
            }
            if !set.is_empty() {
                debug!(selector = %raw, items = set.len(), "items extracted");
                return Ok(set);
            }
        }

        if self.expect_items {
            return Err(ExtractError::Empty {
                url: page.url.clone(),
                tried: self.items.iter().map(|(raw, _)| raw.clone()).collect(),
            });
        }
        Ok(SnapshotSet::new(page.fetched_at))
    }

    fn item_from(&self, element: ElementRef<'_>, page: &RawPage) -> Result<ItemSnapshot, ItemProblem> {
        let url = self
            .href_of(element)
            .and_then(|href| resolve_href(&page.url, href));

        let id = match &self.rules.id {
            IdStrategy::Href => url.as_ref().map(path_id).ok_or(ItemProblem::MissingHref)?,
            IdStrategy::Attribute { name } => element
                .value()
                .attr(name)
                .map(|value| value.trim().to_string())
                .ok_or_else(|| ItemProblem::MissingAttribute(name.clone()))?,
        };
        if id.is_empty() {
            return Err(ItemProblem::EmptyId);
        }

        let text = collapse(element.text());
        let title = first_text(element, &self.titles)
            .or_else(|| element.value().attr("title").map(str::trim).filter(|t| !t.is_empty()).map(String::from))
            .or_else(|| (!text.is_empty()).then(|| text.chars().take(TITLE_FALLBACK_CHARS).collect()))
            .unwrap_or_else(|| id.clone());
        let price = self.price_of(element, &text, &id);
        let availability = self.rules.availability_of(&text);

        Ok(ItemSnapshot {
            id,
            title,
            url: url.map(String::from),
            price,
            availability,
            seen_at: page.fetched_at,
        })
    }

    fn href_of<'a>(&self, element: ElementRef<'a>) -> Option<&'a str> {
        let own = element.value().attr("href");
        let nested = || element.select(&self.anchor).find_map(|a| a.value().attr("href"));
        own.or_else(nested)
            .map(str::trim)
            .filter(|href| !href.is_empty() && !href.to_ascii_lowercase().starts_with("javascript:"))
    }

    /// A price that cannot be normalized is recorded as unknown.
    fn price_of(&self, element: ElementRef<'_>, text: &str, id: &str) -> Option<Price> {
        let raw = first_text(element, &self.prices).or_else(|| price_hint(text).map(String::from))?;
        match parse_price(&raw, self.default_currency.as_deref()) {
            Ok(price) => Some(price),
            Err(err) => {
                warn!(%id, text = %raw, error = %err, "price not understood");
                None
            }
        }
    }
}

fn compile(raw: &str) -> Result<Selector, ExtractError> {
    Selector::parse(raw).map_err(|err| ExtractError::InvalidSelector {
        selector: raw.to_string(),
        reason: format!("{err:?}"),
    })
}

fn compile_all(raw: &[String]) -> Result<Vec<Selector>, ExtractError> {
    raw.iter().map(|s| compile(s)).collect()
}

fn collapse<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(element: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        element
            .select(selector)
            .map(|found| collapse(found.text()))
            .find(|text| !text.is_empty())
    })
}

fn price_hint(text: &str) -> Option<&str> {
    let start = PRICE_HINTS.iter().filter_map(|hint| text.find(hint)).min()?;
    let window = &text[start..];
    let end = window
        .char_indices()
        .nth(24)
        .map(|(idx, _)| idx)
        .unwrap_or(window.len());
    Some(&window[..end])
}

/// Resolves a link against the page it appeared on. Non-http(s) targets
/// such as `mailto:` resolve to `None`.
pub fn resolve_href(page_url: &str, href: &str) -> Option<Url> {
    let url = Url::parse(page_url).ok()?.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// The normalized path of `url`, without query, fragment or trailing slash.
pub fn path_id(url: &Url) -> String {
    url.path().trim_end_matches('/').to_string()
}
