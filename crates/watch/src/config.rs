use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use extractor::{ExtractError, ExtractRules, Extractor};
use fetcher::{PageRequest, RetryPolicy, WaitFor, DEFAULT_BLOCK_MARKERS};
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use snapshot::{FirstRunPolicy, NotifyFilter};
use thiserror::Error;

pub const DEFAULT_TARGET_URL: &str = "https://www.sheinindia.in/c/sverse-5939-37961";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read targets file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse targets file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no targets configured")]
    Empty,
    #[error("target `{target}`: {reason}")]
    Invalid { target: String, reason: String },
    #[error("target `{target}`: {source}")]
    Rules {
        target: String,
        #[source]
        source: ExtractError,
    },
}

/// Inter-cycle pacing: `interval + uniform(jitter_min..=jitter_max)`, never below `floor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub interval_secs: u64,
    pub jitter_min_secs: i64,
    pub jitter_max_secs: i64,
    pub floor_secs: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            jitter_min_secs: -20,
            jitter_max_secs: 30,
            floor_secs: 30,
        }
    }
}

impl Schedule {
    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng>(&self, rng: &mut R) -> Duration {
        let jitter = if self.jitter_min_secs < self.jitter_max_secs {
            rng.gen_range(self.jitter_min_secs..=self.jitter_max_secs)
        } else {
            self.jitter_min_secs
        };
        let secs = (self.interval_secs as i64).saturating_add(jitter).max(0) as u64;
        Duration::from_secs(secs.max(self.floor_secs))
    }
}

/// One monitored listing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "WaitFor::defaults")]
    pub wait: Vec<WaitFor>,
    #[serde(default)]
    pub rules: ExtractRules,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default)]
    pub first_run: FirstRunPolicy,
    #[serde(default)]
    pub notify_on: NotifyFilter,
    #[serde(default = "default_block_markers")]
    pub block_markers: Vec<String>,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default = "default_expect_items")]
    pub expect_items: bool,
}

fn default_navigation_timeout_ms() -> u64 {
    60_000
}

fn default_block_markers() -> Vec<String> {
    DEFAULT_BLOCK_MARKERS.iter().map(|m| m.to_string()).collect()
}

fn default_expect_items() -> bool {
    true
}

impl TargetConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            wait: WaitFor::defaults(),
            rules: ExtractRules::default(),
            schedule: Schedule::default(),
            retry: RetryPolicy::default(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            first_run: FirstRunPolicy::default(),
            notify_on: NotifyFilter::default(),
            block_markers: default_block_markers(),
            default_currency: None,
            expect_items: default_expect_items(),
        }
    }

    pub fn page_request(&self) -> PageRequest {
        PageRequest {
            url: self.url.clone(),
            wait: self.wait.clone(),
            navigation_timeout: Duration::from_millis(self.navigation_timeout_ms),
            block_markers: self.block_markers.clone(),
        }
    }

    pub fn extractor(&self) -> Result<Extractor, ConfigError> {
        Extractor::new(self.rules.clone())
            .map(|extractor| {
                extractor
                    .with_default_currency(self.default_currency.clone())
                    .expect_items(self.expect_items)
            })
            .map_err(|source| ConfigError::Rules {
                target: self.id.clone(),
                source,
            })
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            target: self.id.clone(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("id must not be empty"));
        }
        let url = Url::parse(&self.url)
            .map_err(|err| self.invalid(format!("url `{}` does not parse: {err}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(self.invalid(format!("url `{}` must be http(s)", self.url)));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(self.invalid(format!("url `{}` has no host", self.url)));
        }
        if self.retry.max_attempts == 0 {
            return Err(self.invalid("retry.max_attempts must be at least 1"));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(self.invalid("retry.multiplier must be at least 1.0"));
        }
        if self.schedule.jitter_min_secs > self.schedule.jitter_max_secs {
            return Err(self.invalid("schedule.jitter_min_secs exceeds jitter_max_secs"));
        }
        if self.navigation_timeout_ms == 0 {
            return Err(self.invalid("navigation_timeout_ms must be positive"));
        }
        if self.rules.max_items == 0 {
            return Err(self.invalid("rules.max_items must be at least 1"));
        }
        if self.rules.item_selectors.is_empty() {
            return Err(self.invalid("rules.item_selectors must not be empty"));
        }
        self.extractor().map(|_| ())
    }
}

/// Checks every target and rejects duplicate ids.
pub fn validate_targets(targets: &[TargetConfig]) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::Empty);
    }
    let mut seen = HashSet::new();
    for target in targets {
        target.validate()?;
        if !seen.insert(target.id.as_str()) {
            return Err(target.invalid("duplicate target id"));
        }
    }
    Ok(())
}

pub fn parse_targets(raw: &str) -> Result<Vec<TargetConfig>, ConfigError> {
    let targets: Vec<TargetConfig> = serde_json::from_str(raw)?;
    validate_targets(&targets)?;
    Ok(targets)
}

pub fn load_targets(path: &Path) -> Result<Vec<TargetConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_targets(&raw)
}
