use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use jobmon_core::{CycleReport, JobListing, StoreStats};
use jobmon_notify::NotificationManager;
use jobmon_storage::JobStore;
use jobmon_sync::{CliOverrides, KeywordFilter, MonitorConfig, ScanOrchestrator, Scheduler};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Scan once and exit.
    Run,
    /// Scan on the configured interval until Ctrl+C.
    Schedule,
    Stats,
    /// List unread listings.
    New,
    /// Delete listings older than the retention window.
    Cleanup,
    TestEmail,
}

#[derive(Debug, Parser)]
#[command(name = "jobmon")]
#[command(about = "Watch job boards and report newly posted listings")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Schedule)]
    mode: Mode,

    /// Search term, replacing SEARCH_TERMS.
    #[arg(long)]
    search: Option<String>,

    #[arg(long)]
    location: Option<String>,

    /// Comma-separated source names, e.g. indeed,linkedin.
    #[arg(long, value_delimiter = ',')]
    sources: Option<Vec<String>>,

    /// With `--mode new`, mark the listed jobs as read.
    #[arg(long)]
    mark_read: bool,

    /// Retention window for `--mode cleanup`; defaults to CLEANUP_RETENTION_DAYS.
    #[arg(long)]
    cleanup_days: Option<u32>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobmon_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = MonitorConfig::from_env();

    match cli.mode {
        Mode::Run => {
            let config = scan_config(config, &cli)?;
            let scheduler = build_scheduler(&config).await?;
            let report = scheduler.run_once(&CancellationToken::new()).await?;
            print_cycle_summary(&report);
        }
        Mode::Schedule => {
            let config = scan_config(config, &cli)?;
            let scheduler = build_scheduler(&config).await?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested; finishing current cycle");
                    on_signal.cancel();
                }
            });

            let state = scheduler.run_schedule(config.interval(), cancel).await;
            println!("scheduler stopped after {} cycle(s)", state.cycles_run);
        }
        Mode::Stats => {
            let store = JobStore::connect(&config.database_url).await?;
            let stats = store.stats().await?;
            let latest = store.recent(5).await?;
            print_stats(&stats, &latest);
        }
        Mode::New => {
            let store = JobStore::connect(&config.database_url).await?;
            let unread = store.unread(None).await?;
            print_new_listings(&unread);
            if cli.mark_read && !unread.is_empty() {
                let fingerprints: Vec<String> = unread.iter().map(|l| l.fingerprint.clone()).collect();
                let marked = store.mark_read(&fingerprints).await?;
                println!("marked {marked} listing(s) as read");
            }
        }
        Mode::Cleanup => {
            let days = cli.cleanup_days.unwrap_or(config.cleanup_days);
            let store = JobStore::connect(&config.database_url).await?;
            let deleted = store.cleanup(days).await?;
            println!("removed {deleted} listing(s) first seen more than {days} day(s) ago");
        }
        Mode::TestEmail => {
            println!("sending test email...");
            NotificationManager::from_settings(config.smtp.as_ref())
                .test_email()
                .await
                .context("test email failed; check SMTP_* and EMAIL_* settings")?;
            println!("test email sent");
        }
    }

    Ok(())
}

/// Searches only matter when scanning, so the searches file is read here and not at startup.
fn scan_config(mut config: MonitorConfig, cli: &Cli) -> Result<MonitorConfig> {
    config.load_searches().context("loading searches file")?;
    config.apply_overrides(&CliOverrides {
        search: cli.search.clone(),
        location: cli.location.clone(),
        sources: cli.sources.clone(),
    });
    Ok(config)
}

async fn build_scheduler(config: &MonitorConfig) -> Result<Scheduler> {
    config.validate().context("invalid configuration")?;

    let store = JobStore::connect(&config.database_url).await?;
    let adapters = config.build_adapters()?;
    let pairs = config.scan_pairs(&adapters);
    let filter = KeywordFilter::new(&config.required_keywords, &config.excluded_keywords);
    let orchestrator =
        ScanOrchestrator::new(store, config.scan_options()).with_filter(Arc::new(filter));
    let notifier = Arc::new(NotificationManager::from_settings(config.smtp.as_ref()));

    info!(
        searches = config.searches.len(),
        pairs = pairs.len(),
        email = notifier.email_enabled(),
        "job monitor configured"
    );
    Ok(Scheduler::new(orchestrator, pairs, notifier).with_reports_dir(config.reports_dir.clone()))
}

fn rule() -> String {
    "=".repeat(60)
}

fn print_cycle_summary(report: &CycleReport) {
    println!(
        "cycle complete: run_id={} new={} duplicates={} failed_sources={} elapsed={:.1}s",
        report.run_id,
        report.new_count(),
        report.duplicates_skipped,
        report.failed_sources.len(),
        report.duration.as_secs_f64()
    );
    for failure in &report.failed_sources {
        println!(
            "  failed: {} ({} @ {}): {}",
            failure.source, failure.term, failure.location, failure.reason
        );
    }
}

fn print_stats(stats: &StoreStats, latest: &[JobListing]) {
    println!("\n{}\nJOB MONITOR STATISTICS\n{}", rule(), rule());
    println!("\nTotal jobs tracked: {}", stats.total_jobs);
    println!("Unread jobs: {}", stats.unread);
    println!("New in the last 24h: {}", stats.new_today);
    println!("Searches in the last 24h: {}", stats.searches_run);

    if !stats.by_source.is_empty() {
        println!("\nJobs by source:");
        for (source, count) in &stats.by_source {
            println!("  - {source}: {count}");
        }
    }

    if !latest.is_empty() {
        println!("\nLatest listings:");
        for job in latest {
            println!("  - {} | {} ({})", job.title, job.company, job.first_seen_at.format("%Y-%m-%d %H:%M"));
        }
    }
    println!("{}\n", rule());
}

fn print_new_listings(listings: &[JobListing]) {
    if listings.is_empty() {
        println!("\nNo new jobs to display\n");
        return;
    }

    println!("\n{}\nNEW JOB LISTINGS ({})\n{}\n", rule(), listings.len(), rule());
    for (idx, job) in listings.iter().enumerate() {
        println!("{}. {}", idx + 1, job.title);
        println!("   Company: {}", job.company);
        println!("   Location: {}", job.location);
        println!("   Source: {}", job.source);
        println!("   First seen: {}", job.first_seen_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if !job.url.is_empty() {
            println!("   URL: {}", job.url);
        }
        println!();
    }
    println!("{}\n", rule());
}
