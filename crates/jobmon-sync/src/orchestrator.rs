use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use jobmon_adapters::{SourceAdapter, SourceFetchError};
use jobmon_core::{normalize, CycleReport, JobListing, RawRecord, SearchQuery, SourceFailure};
use jobmon_storage::{BackoffPolicy, JobStore, StoreError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::filter::{ListingFilter, PassThroughFilter};
use crate::reconcile::Reconciler;

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Maximum (query, source) fetches in flight at once.
    pub concurrency: usize,
    /// Budget for one (query, source) fetch across all its pages.
    pub fetch_timeout: Duration,
    pub retry: BackoffPolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fetch_timeout: Duration::from_secs(120),
            retry: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct ScanPair {
    pub query: SearchQuery,
    pub adapter: Arc<dyn SourceAdapter>,
    pub max_pages: u32,
}

impl ScanPair {
    pub fn source(&self) -> &'static str {
        self.adapter.source_name()
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum PairOutcome {
    Fetched(Vec<RawRecord>),
    Failed(String),
    /// Never started; the cycle was cancelled first.
    Skipped,
}

pub struct ScanOrchestrator {
    store: JobStore,
    reconciler: Reconciler,
    options: ScanOptions,
    filter: Arc<dyn ListingFilter>,
}

impl ScanOrchestrator {
    pub fn new(store: JobStore, options: ScanOptions) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            store,
            options,
            filter: Arc::new(PassThroughFilter),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn ListingFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Scan every query against every adapter.
    pub async fn run_cycle(
        &self,
        queries: &[SearchQuery],
        adapters: &[Arc<dyn SourceAdapter>],
        max_pages: u32,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let pairs = queries
            .iter()
            .flat_map(|query| {
                adapters.iter().map(move |adapter| ScanPair {
                    query: query.clone(),
                    adapter: adapter.clone(),
                    max_pages,
                })
            })
            .collect();
        self.run_pairs(pairs, cancel).await
    }

    /// Fetch all pairs with bounded concurrency, then normalize, filter and
    /// reconcile the combined results as one batch.
    ///
    /// Pair failures and timeouts are recorded in the report. Only a store
    /// failure fails the cycle.
    pub async fn run_pairs(
        &self,
        pairs: Vec<ScanPair>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let clock = Instant::now();
        let mut report = CycleReport::empty(Utc::now());
        let span = info_span!("scan_cycle", run_id = %report.run_id, pairs = pairs.len());

        self.execute(&mut report, pairs, cancel).instrument(span).await?;

        report.finished_at = Utc::now();
        report.duration = clock.elapsed();
        info!(
            run_id = %report.run_id,
            new = report.new_count(),
            duplicates = report.duplicates_skipped,
            failed = report.failed_sources.len(),
            skipped_pairs = report.pairs_skipped,
            elapsed_ms = report.duration.as_millis() as u64,
            "scan cycle complete"
        );
        Ok(report)
    }

    async fn execute(
        &self,
        report: &mut CycleReport,
        pairs: Vec<ScanPair>,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError> {
        let mut outcomes = self.fetch_all(pairs, cancel).await;
        outcomes.sort_by(|(a, _), (b, _)| (&a.query, a.source()).cmp(&(&b.query, b.source())));

        let mut listings = Vec::new();
        let mut found_per_query: BTreeMap<SearchQuery, u64> = BTreeMap::new();
        for (pair, outcome) in outcomes {
            match outcome {
                PairOutcome::Fetched(records) => {
                    info!(
                        source = pair.source(),
                        term = %pair.query.term,
                        location = %pair.query.location,
                        records = records.len(),
                        "source scanned"
                    );
                    report.records_fetched += records.len();
                    *found_per_query.entry(pair.query.clone()).or_default() += records.len() as u64;
                    listings.extend(self.normalize_records(report, &pair, &records));
                }
                PairOutcome::Failed(reason) => {
                    warn!(
                        source = pair.source(),
                        term = %pair.query.term,
                        location = %pair.query.location,
                        %reason,
                        "source failed; continuing cycle"
                    );
                    found_per_query.entry(pair.query.clone()).or_default();
                    report.failed_sources.push(SourceFailure {
                        source: pair.source().to_string(),
                        term: pair.query.term.clone(),
                        location: pair.query.location.clone(),
                        reason,
                    });
                }
                PairOutcome::Skipped => report.pairs_skipped += 1,
            }
        }

        let (kept, dropped) = self.filter.apply(listings);
        report.filtered_out = dropped;
        self.reconciler.reconcile_into(report, kept).await?;

        // Listings are committed by now; a history failure must not hide them from the notifier.
        let ran_at = Utc::now();
        for (query, found) in &found_per_query {
            if let Err(err) = self
                .store
                .record_search(&query.term, &query.location, *found, ran_at)
                .await
            {
                warn!(term = %query.term, location = %query.location, error = %err, "failed to record search history");
            }
        }
        Ok(())
    }

    fn normalize_records(
        &self,
        report: &mut CycleReport,
        pair: &ScanPair,
        records: &[RawRecord],
    ) -> Vec<JobListing> {
        let mut out = Vec::with_capacity(records.len());
        for raw in records {
            match normalize(raw, pair.source()) {
                Ok(mut listing) => {
                    listing.search_term = pair.query.term.clone();
                    out.push(listing);
                }
                Err(err) => {
                    report.malformed_skipped += 1;
                    debug!(error = %err, "skipping malformed record");
                }
            }
        }
        out
    }

    /// Every pair runs on its own task gated by a semaphore. A pair whose
    /// turn comes after cancellation is skipped; started pairs run to completion.
    async fn fetch_all(
        &self,
        pairs: Vec<ScanPair>,
        cancel: &CancellationToken,
    ) -> Vec<(ScanPair, PairOutcome)> {
        let limit = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut handles = Vec::with_capacity(pairs.len());

        for pair in pairs {
            let limit = limit.clone();
            let cancel = cancel.clone();
            let timeout = self.options.fetch_timeout;
            let retry = self.options.retry;
            let task_pair = pair.clone();
            let span = info_span!(
                "scan_pair",
                source = pair.source(),
                term = %pair.query.term,
                location = %pair.query.location
            );

            let handle = tokio::spawn(
                async move {
                    let Ok(_permit) = limit.acquire().await else {
                        return PairOutcome::Skipped;
                    };
                    if cancel.is_cancelled() {
                        return PairOutcome::Skipped;
                    }

                    let pages = task_pair
                        .adapter
                        .fetch(&task_pair.query, task_pair.max_pages, retry);
                    match tokio::time::timeout(timeout, pages.collect_all()).await {
                        Ok(Ok(records)) => PairOutcome::Fetched(records),
                        Ok(Err(err)) => PairOutcome::Failed(err.to_string()),
                        Err(_) => PairOutcome::Failed(SourceFetchError::Timeout(timeout).to_string()),
                    }
                }
                .instrument(span),
            );
            handles.push((pair, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (pair, handle) in handles {
            let outcome = handle
                .await
                .unwrap_or_else(|err| PairOutcome::Failed(format!("fetch task aborted: {err}")));
            outcomes.push((pair, outcome));
        }
        outcomes
    }
}
