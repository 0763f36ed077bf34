use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobmon_adapters::{adapter_for_source, normalize_source_name, SourceAdapter, KNOWN_SOURCES};
use jobmon_core::SearchQuery;
use jobmon_notify::SmtpSettings;
use jobmon_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, TokenBucketConfig, DEFAULT_USER_AGENT};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::orchestrator::{ScanOptions, ScanPair};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://jobs.db?mode=rwc";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("at least one search term is required")]
    NoSearchTerms,
    #[error("at least one source is required")]
    NoSources,
    #[error("unknown source {name:?}; expected one of {}", KNOWN_SOURCES.join(", "))]
    UnknownSource { name: String },
    #[error("max pages per source must be at least 1")]
    ZeroMaxPages,
    #[error("check interval must be at least 1 minute")]
    ZeroInterval,
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
}

/// One configured search. `sources`/`max_pages` override the global values when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPlan {
    pub query: SearchQuery,
    pub sources: Option<Vec<String>>,
    pub max_pages: Option<u32>,
}

impl SearchPlan {
    pub fn new(query: SearchQuery) -> Self {
        Self {
            query,
            sources: None,
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchesFile {
    #[serde(default)]
    pub searches: Vec<SearchEntry>,
    #[serde(default)]
    pub required_keywords: Vec<String>,
    #[serde(default)]
    pub excluded_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchEntry {
    pub search_term: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

pub fn load_searches_file(path: &Path) -> Result<SearchesFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Command-line values that win over the environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub search: Option<String>,
    pub location: Option<String>,
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    pub searches: Vec<SearchPlan>,
    pub sources: Vec<String>,
    pub max_pages: u32,
    pub interval_minutes: u64,
    pub cleanup_days: u32,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub http_timeout: Duration,
    pub page_delay: Duration,
    pub user_agent: String,
    pub required_keywords: Vec<String>,
    pub excluded_keywords: Vec<String>,
    pub reports_dir: Option<PathBuf>,
    /// Read by [`MonitorConfig::load_searches`]; only scanning modes need it.
    pub searches_file: Option<PathBuf>,
    /// Request budget shared by every adapter; `None` leaves fetches unthrottled.
    pub rate_limit: Option<TokenBucketConfig>,
    pub smtp: Option<SmtpSettings>,
}

fn comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses straight into `T`, so out-of-range values fall back like any other bad input.
fn parsed_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| parsed_or(lookup(key), default);

        let location = lookup("LOCATION").unwrap_or_else(|| "remote".to_string());
        let terms = comma_list(&lookup("SEARCH_TERMS").unwrap_or_else(|| "python developer".to_string()));

        let rate_limit = match parsed_or(lookup("JOBMON_RATE_LIMIT_BURST"), 0u32) {
            0 => None,
            capacity => Some(TokenBucketConfig {
                capacity,
                refill_every: Duration::from_millis(number("JOBMON_RATE_LIMIT_REFILL_MS", 1000).max(1)),
            }),
        };

        Self {
            database_url: lookup("JOBMON_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            searches: terms
                .into_iter()
                .map(|term| SearchPlan::new(SearchQuery::new(term, location.trim())))
                .collect(),
            sources: comma_list(&lookup("SOURCES").unwrap_or_else(|| "indeed".to_string())),
            max_pages: parsed_or(lookup("MAX_PAGES_TO_SCRAPE"), 5),
            interval_minutes: number("CHECK_INTERVAL_MINUTES", 60),
            cleanup_days: parsed_or(lookup("CLEANUP_RETENTION_DAYS"), 30),
            concurrency: parsed_or(lookup("JOBMON_CONCURRENCY"), 4),
            fetch_timeout: Duration::from_secs(number("JOBMON_FETCH_TIMEOUT_SECS", 120)),
            http_timeout: Duration::from_secs(number("JOBMON_HTTP_TIMEOUT_SECS", 10)),
            page_delay: Duration::from_millis(number("JOBMON_PAGE_DELAY_MS", 2000)),
            user_agent: lookup("JOBMON_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            required_keywords: Vec::new(),
            excluded_keywords: Vec::new(),
            reports_dir: lookup("JOBMON_REPORTS_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            searches_file: lookup("JOBMON_SEARCHES_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            rate_limit,
            smtp: SmtpSettings::from_lookup(&lookup),
        }
    }

    /// Apply `JOBMON_SEARCHES_FILE` when one is configured.
    pub fn load_searches(&mut self) -> Result<()> {
        if let Some(path) = self.searches_file.clone() {
            let file = load_searches_file(&path)?;
            self.apply_searches_file(file);
        }
        Ok(())
    }

    /// A non-empty `searches:` list replaces the environment searches.
    pub fn apply_searches_file(&mut self, file: SearchesFile) {
        if !file.searches.is_empty() {
            self.searches = file
                .searches
                .into_iter()
                .map(|entry| SearchPlan {
                    query: SearchQuery::new(entry.search_term.trim(), entry.location.trim()),
                    sources: entry.sources,
                    max_pages: entry.max_pages,
                })
                .collect();
        }
        self.required_keywords = file.required_keywords;
        self.excluded_keywords = file.excluded_keywords;
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(term) = &overrides.search {
            let location = overrides
                .location
                .clone()
                .or_else(|| self.searches.first().map(|p| p.query.location.clone()))
                .unwrap_or_default();
            self.searches = vec![SearchPlan::new(SearchQuery::new(term.trim(), location.trim()))];
        } else if let Some(location) = &overrides.location {
            for plan in &mut self.searches {
                plan.query.location = location.trim().to_string();
            }
        }

        if let Some(sources) = &overrides.sources {
            self.sources = sources
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            for plan in &mut self.searches {
                plan.sources = None;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.searches.is_empty() || self.searches.iter().any(|p| p.query.term.trim().is_empty()) {
            return Err(ConfigValidationError::NoSearchTerms);
        }
        if self.sources.is_empty() {
            return Err(ConfigValidationError::NoSources);
        }

        for plan in &self.searches {
            let sources = plan.sources.as_ref().unwrap_or(&self.sources);
            if sources.is_empty() {
                return Err(ConfigValidationError::NoSources);
            }
            if plan.max_pages == Some(0) {
                return Err(ConfigValidationError::ZeroMaxPages);
            }
        }

        for name in self.all_sources() {
            if !KNOWN_SOURCES.contains(&normalize_source_name(&name).as_str()) {
                return Err(ConfigValidationError::UnknownSource { name });
            }
        }

        if self.max_pages == 0 {
            return Err(ConfigValidationError::ZeroMaxPages);
        }
        if self.interval_minutes == 0 {
            return Err(ConfigValidationError::ZeroInterval);
        }
        if self.concurrency == 0 {
            return Err(ConfigValidationError::ZeroConcurrency);
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            concurrency: self.concurrency,
            fetch_timeout: self.fetch_timeout,
            retry: BackoffPolicy::default(),
        }
    }

    /// Every source named globally or by any search, deduplicated in order.
    fn all_sources(&self) -> Vec<String> {
        let mut seen = Vec::new();
        let per_plan = self.searches.iter().filter_map(|p| p.sources.as_ref()).flatten();
        for name in self.sources.iter().chain(per_plan) {
            if !seen.contains(name) {
                seen.push(name.clone());
            }
        }
        seen
    }

    /// One shared HTTP fetcher behind one adapter per configured source.
    pub fn build_adapters(&self) -> Result<BTreeMap<String, Arc<dyn SourceAdapter>>> {
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: self.http_timeout,
                user_agent: Some(self.user_agent.clone()),
                global_concurrency: self.concurrency.max(1),
                token_bucket: self.rate_limit,
            })
            .context("building http client")?,
        );

        let mut adapters = BTreeMap::new();
        for name in self.all_sources() {
            let key = normalize_source_name(&name);
            let adapter = adapter_for_source(&key, http.clone(), self.page_delay)
                .with_context(|| format!("no adapter registered for {name}"))?;
            adapters.insert(key, adapter);
        }
        Ok(adapters)
    }

    /// Expand searches into (query, adapter) pairs using each search's sources and page limit.
    pub fn scan_pairs(&self, adapters: &BTreeMap<String, Arc<dyn SourceAdapter>>) -> Vec<ScanPair> {
        let mut pairs = Vec::new();
        for plan in &self.searches {
            let sources = plan.sources.as_ref().unwrap_or(&self.sources);
            let max_pages = plan.max_pages.unwrap_or(self.max_pages);
            for name in sources {
                match adapters.get(&normalize_source_name(name)) {
                    Some(adapter) => pairs.push(ScanPair {
                        query: plan.query.clone(),
                        adapter: adapter.clone(),
                        max_pages,
                    }),
                    None => warn!(source = %name, "no adapter for configured source; skipping"),
                }
            }
        }
        pairs
    }
}
