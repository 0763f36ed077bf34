//! Persisted relation of every listing ever seen, keyed by fingerprint.

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use jobmon_core::{JobListing, StoreStats};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("invalid {table} row: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: bool,
}

const JOB_COLUMNS: &str = "fingerprint, source, title, company, location, url, posted_date, \
     description_snippet, search_term, first_seen_at, is_read";

const INSERT_IF_ABSENT: &str = "INSERT INTO jobs (fingerprint, source, title, company, location, url, \
     posted_date, description_snippet, search_term, first_seen_at, is_read) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
     ON CONFLICT(fingerprint) DO NOTHING";

/// Fixed-width UTC text so lexical order in SQL matches time order.
/// `None` when the window reaches further back than chrono can represent.
fn retention_cutoff(now: DateTime<Utc>, older_than_days: u32) -> Option<DateTime<Utc>> {
    ChronoDuration::try_days(i64::from(older_than_days)).and_then(|window| now.checked_sub_signed(window))
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow {
            table,
            reason: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn listing_from_row(row: &SqliteRow) -> Result<JobListing, StoreError> {
    let first_seen_at: String = row.try_get("first_seen_at")?;
    Ok(JobListing {
        fingerprint: row.try_get("fingerprint")?,
        source: row.try_get("source")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        posted_date: row.try_get("posted_date")?,
        description_snippet: row.try_get("description_snippet")?,
        search_term: row.try_get("search_term")?,
        first_seen_at: decode_ts("jobs", &first_seen_at)?,
        is_read: row.try_get("is_read")?,
    })
}

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if needed) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "job store ready");
        Ok(store)
    }

    /// Ephemeral store on a single pinned connection; every in-memory
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                fingerprint TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL,
                posted_date TEXT,
                description_snippet TEXT NOT NULL DEFAULT '',
                search_term TEXT NOT NULL DEFAULT '',
                first_seen_at TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_is_read ON jobs(is_read)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_first_seen_at ON jobs(first_seen_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS search_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                search_term TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT '',
                ran_at TEXT NOT NULL,
                listings_found INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert-if-absent. An existing row keeps its first-seen time and read state.
    pub async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome = insert_if_absent(&mut tx, listing).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Upsert a whole batch in one transaction; outcomes follow input order.
    pub async fn upsert_many(&self, listings: &[JobListing]) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(listings.len());
        for listing in listings {
            outcomes.push(insert_if_absent(&mut tx, listing).await?);
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<JobListing>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE fingerprint = ?");
        let row = sqlx::query(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    /// Unread listings, newest first. `since` limits to listings first seen at or after it.
    pub async fn unread(&self, since: Option<DateTime<Utc>>) -> Result<Vec<JobListing>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE is_read = 0 AND (?1 IS NULL OR first_seen_at >= ?1) \
             ORDER BY first_seen_at DESC, fingerprint ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(since.map(encode_ts))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    pub async fn recent(&self, limit: u32) -> Result<Vec<JobListing>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY first_seen_at DESC, fingerprint ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Returns how many listings flipped from unread to read. Unknown fingerprints are ignored.
    pub async fn mark_read(&self, fingerprints: &[String]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;
        for fingerprint in fingerprints {
            updated += sqlx::query("UPDATE jobs SET is_read = 1 WHERE fingerprint = ? AND is_read = 0")
                .bind(fingerprint)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        debug!(requested = fingerprints.len(), updated, "marked listings read");
        Ok(updated)
    }

    /// Delete listings first seen more than `older_than_days` ago, read or not.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64, StoreError> {
        let Some(cutoff) = retention_cutoff(Utc::now(), older_than_days) else {
            info!(older_than_days, "retention window reaches past the earliest date; nothing to clean");
            return Ok(0);
        };
        let deleted = self.cleanup_before(cutoff).await?;
        info!(older_than_days, deleted, "cleaned up old listings");
        Ok(deleted)
    }

    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE first_seen_at < ?")
            .bind(encode_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn record_search(
        &self,
        term: &str,
        location: &str,
        listings_found: u64,
        ran_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO search_history (search_term, location, ran_at, listings_found) VALUES (?, ?, ?, ?)",
        )
        .bind(term)
        .bind(location)
        .bind(encode_ts(ran_at))
        .bind(i64::try_from(listings_found).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.stats_at(Utc::now()).await
    }

    pub async fn stats_at(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let day_ago = encode_ts(now - ChronoDuration::hours(24));

        let total_jobs = self.count("SELECT COUNT(*) FROM jobs", None).await?;
        let unread = self
            .count("SELECT COUNT(*) FROM jobs WHERE is_read = 0", None)
            .await?;
        let new_today = self
            .count(
                "SELECT COUNT(*) FROM jobs WHERE first_seen_at >= ?",
                Some(&day_ago),
            )
            .await?;
        let searches_run = self
            .count(
                "SELECT COUNT(*) FROM search_history WHERE ran_at >= ?",
                Some(&day_ago),
            )
            .await?;

        let rows = sqlx::query("SELECT source, COUNT(*) AS n FROM jobs GROUP BY source ORDER BY source")
            .fetch_all(&self.pool)
            .await?;
        let mut by_source = std::collections::BTreeMap::new();
        for row in rows {
            let source: String = row.try_get("source")?;
            let n: i64 = row.try_get("n")?;
            by_source.insert(source, n.max(0) as u64);
        }

        Ok(StoreStats {
            total_jobs,
            unread,
            new_today,
            by_source,
            searches_run,
        })
    }

    async fn count(&self, sql: &str, arg: Option<&str>) -> Result<u64, StoreError> {
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        if let Some(arg) = arg {
            query = query.bind(arg);
        }
        let n = query.fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }
}

async fn insert_if_absent(
    tx: &mut Transaction<'_, Sqlite>,
    listing: &JobListing,
) -> Result<UpsertOutcome, StoreError> {
    let result = sqlx::query(INSERT_IF_ABSENT)
        .bind(&listing.fingerprint)
        .bind(&listing.source)
        .bind(&listing.title)
        .bind(&listing.company)
        .bind(&listing.location)
        .bind(&listing.url)
        .bind(&listing.posted_date)
        .bind(&listing.description_snippet)
        .bind(&listing.search_term)
        .bind(encode_ts(listing.first_seen_at))
        .bind(listing.is_read)
        .execute(&mut **tx)
        .await?;
    Ok(UpsertOutcome {
        inserted: result.rows_affected() == 1,
    })
}
