use chrono::Utc;
use jobmon_core::{CycleReport, JobListing};
use jobmon_storage::{JobStore, StoreError};
use tracing::debug;

/// Writes one cycle's listings and reports which were new to the store.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: JobStore,
}

impl Reconciler {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub async fn reconcile(&self, listings: Vec<JobListing>) -> Result<CycleReport, StoreError> {
        let mut report = CycleReport::empty(Utc::now());
        self.reconcile_into(&mut report, listings).await?;
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Upsert `listings` as one batch, filling the new/duplicate fields of `report`.
    /// A fingerprint repeated within the batch counts as new once.
    pub async fn reconcile_into(
        &self,
        report: &mut CycleReport,
        listings: Vec<JobListing>,
    ) -> Result<(), StoreError> {
        let outcomes = self.store.upsert_many(&listings).await?;
        for (listing, outcome) in listings.into_iter().zip(outcomes) {
            if outcome.inserted {
                report.new_listings.push(listing);
            } else {
                report.duplicates_skipped += 1;
            }
        }
        debug!(
            new = report.new_listings.len(),
            duplicates = report.duplicates_skipped,
            "reconciled batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmon_core::{normalize, RawRecord};

    fn listing(title: &str) -> JobListing {
        normalize(
            &RawRecord {
                title: Some(title.into()),
                company: Some("Acme".into()),
                url: Some(format!("https://example.com/{title}")),
                ..Default::default()
            },
            "indeed",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn same_batch_twice_is_new_then_all_duplicates() {
        let store = JobStore::in_memory().await.unwrap();
        let reconciler = Reconciler::new(store);
        let batch = vec![listing("a"), listing("b"), listing("c")];

        let first = reconciler.reconcile(batch.clone()).await.unwrap();
        assert_eq!(first.new_count(), 3);
        assert_eq!(first.duplicates_skipped, 0);

        let second = reconciler.reconcile(batch).await.unwrap();
        assert_eq!(second.new_count(), 0);
        assert_eq!(second.duplicates_skipped, 3);
    }

    #[tokio::test]
    async fn repeated_fingerprint_in_one_batch_is_new_once() {
        let store = JobStore::in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone());

        let report = reconciler
            .reconcile(vec![listing("x"), listing("y"), listing("y")])
            .await
            .unwrap();
        assert_eq!(report.new_count(), 2);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(store.stats().await.unwrap().total_jobs, 2);
    }
}
