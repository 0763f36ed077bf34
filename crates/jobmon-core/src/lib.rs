//! Core domain model and listing normalization for jobmon.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobmon-core";

/// Separator between normalized fields before hashing. Never appears in
/// whitespace-collapsed text.
const FINGERPRINT_FIELD_SEPARATOR: char = '\u{1f}';

/// One (term, location) pair to scan against every configured source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SearchQuery {
    pub term: String,
    pub location: String,
}

impl SearchQuery {
    pub fn new(term: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            location: location.into(),
        }
    }
}

/// Adapter handoff record. Anything a site does not report stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub posted_date: Option<String>,
    pub description_snippet: Option<String>,
}

/// Canonical persisted listing keyed by `fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    pub fingerprint: String,
    pub source: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub posted_date: Option<String>,
    pub description_snippet: String,
    /// Search term that first surfaced this listing.
    pub search_term: String,
    pub first_seen_at: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedListingError {
    #[error("listing from {source_name} has no title")]
    MissingTitle { source_name: String },
    #[error("listing from {source_name} has no url (title: {title})")]
    MissingUrl { source_name: String, title: String },
}

/// A (query, source) pair that failed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub term: String,
    pub location: String,
    pub reason: String,
}

/// Outcome of one scan cycle. Never persisted as-is.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub new_listings: Vec<JobListing>,
    pub duplicates_skipped: usize,
    pub failed_sources: Vec<SourceFailure>,
    pub records_fetched: usize,
    pub malformed_skipped: usize,
    pub filtered_out: usize,
    /// Pairs never started because the cycle was cancelled.
    pub pairs_skipped: usize,
}

impl CycleReport {
    pub fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            duration: Duration::ZERO,
            new_listings: Vec::new(),
            duplicates_skipped: 0,
            failed_sources: Vec::new(),
            records_fetched: 0,
            malformed_skipped: 0,
            filtered_out: 0,
            pairs_skipped: 0,
        }
    }

    pub fn new_count(&self) -> usize {
        self.new_listings.len()
    }
}

/// Aggregate view over the job store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_jobs: u64,
    pub unread: u64,
    /// Listings first seen within the last 24 hours.
    pub new_today: u64,
    pub by_source: BTreeMap<String, u64>,
    /// Searches recorded within the last 24 hours.
    pub searches_run: u64,
}

/// Lowercase, trim and collapse internal whitespace runs to a single space.
pub fn normalize_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic identity over the normalized core fields, as lowercase hex SHA-256.
pub fn fingerprint(source: &str, title: &str, company: &str, location: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in [source, title, company, location, url].iter().enumerate() {
        if idx > 0 {
            let mut buf = [0u8; 4];
            hasher.update(FINGERPRINT_FIELD_SEPARATOR.encode_utf8(&mut buf).as_bytes());
        }
        hasher.update(normalize_fragment(part).as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn display_text(value: Option<&str>) -> Option<String> {
    let collapsed = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Normalize a raw adapter record, stamping `first_seen_at` with the current time.
pub fn normalize(raw: &RawRecord, source: &str) -> Result<JobListing, MalformedListingError> {
    normalize_at(raw, source, Utc::now())
}

pub fn normalize_at(
    raw: &RawRecord,
    source: &str,
    observed_at: DateTime<Utc>,
) -> Result<JobListing, MalformedListingError> {
    let title = display_text(raw.title.as_deref()).ok_or_else(|| MalformedListingError::MissingTitle {
        source_name: source.to_string(),
    })?;
    let url = display_text(raw.url.as_deref()).ok_or_else(|| MalformedListingError::MissingUrl {
        source_name: source.to_string(),
        title: title.clone(),
    })?;
    let company = display_text(raw.company.as_deref()).unwrap_or_default();
    let location = display_text(raw.location.as_deref()).unwrap_or_default();

    Ok(JobListing {
        fingerprint: fingerprint(source, &title, &company, &location, &url),
        source: source.to_string(),
        posted_date: display_text(raw.posted_date.as_deref()),
        description_snippet: display_text(raw.description_snippet.as_deref()).unwrap_or_default(),
        search_term: String::new(),
        first_seen_at: observed_at,
        is_read: false,
        title,
        company,
        location,
        url,
    })
}
