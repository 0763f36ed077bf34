#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobmon_adapters::{PageOutcome, SourceAdapter, SourceFetchError};
use jobmon_core::{JobListing, RawRecord, SearchQuery};
use jobmon_notify::{Notifier, NotifyError};
use jobmon_storage::BackoffPolicy;
use tokio_util::sync::CancellationToken;

pub enum Behavior {
    Pages(Vec<Vec<RawRecord>>),
    Fail,
    Hang(Duration),
}

pub struct FakeAdapter {
    name: &'static str,
    behavior: Behavior,
    calls: AtomicU32,
}

impl FakeAdapter {
    pub fn pages(name: &'static str, pages: Vec<Vec<RawRecord>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior: Behavior::Pages(pages),
            calls: AtomicU32::new(0),
        })
    }

    pub fn single(name: &'static str, records: Vec<RawRecord>) -> Arc<Self> {
        Self::pages(name, vec![records])
    }

    pub fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior: Behavior::Fail,
            calls: AtomicU32::new(0),
        })
    }

    pub fn hanging(name: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior: Behavior::Hang(delay),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn source_name(&self) -> &'static str {
        self.name
    }

    async fn fetch_page(
        &self,
        _query: &SearchQuery,
        page: u32,
        _retry: &BackoffPolicy,
    ) -> Result<PageOutcome, SourceFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Pages(pages) => Ok(pages
                .get(page as usize)
                .cloned()
                .map(PageOutcome::Records)
                .unwrap_or(PageOutcome::Exhausted)),
            Behavior::Fail => Err(SourceFetchError::Parse("unexpected markup".into())),
            Behavior::Hang(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(PageOutcome::Exhausted)
            }
        }
    }
}

pub fn record(title: &str, company: &str) -> RawRecord {
    RawRecord {
        title: Some(title.into()),
        company: Some(company.into()),
        location: Some("Remote".into()),
        url: Some(format!(
            "https://jobs.example.com/{}",
            title.to_lowercase().replace(' ', "-")
        )),
        ..Default::default()
    }
}

/// Records every batch; optionally fails or cancels a token on delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    pub batches: Mutex<Vec<Vec<JobListing>>>,
    pub fail: bool,
    pub cancel_on_notify: Option<CancellationToken>,
}

impl RecordingNotifier {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .map(|b| b.iter().map(Vec::len).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, listings: &[JobListing]) -> Result<(), NotifyError> {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(listings.to_vec());
        }
        if let Some(token) = &self.cancel_on_notify {
            token.cancel();
        }
        if self.fail {
            Err(NotifyError::Smtp("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn channel_name(&self) -> &str {
        "recording"
    }
}
