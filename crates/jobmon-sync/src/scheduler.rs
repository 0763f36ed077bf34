use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmon_core::CycleReport;
use jobmon_notify::Notifier;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::orchestrator::{CycleError, ScanOrchestrator, ScanPair};
use crate::report::write_cycle_report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Sleeping,
    Stopped,
}

/// State carried from one loop iteration to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopState {
    pub state: SchedulerState,
    pub cycles_run: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            cycles_run: 0,
            last_run_at: None,
            consecutive_failures: 0,
        }
    }
}

pub struct Scheduler {
    orchestrator: ScanOrchestrator,
    pairs: Vec<ScanPair>,
    notifier: Arc<dyn Notifier>,
    reports_dir: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(orchestrator: ScanOrchestrator, pairs: Vec<ScanPair>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            orchestrator,
            pairs,
            notifier,
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: Option<PathBuf>) -> Self {
        self.reports_dir = reports_dir;
        self
    }

    /// Run one cycle and notify on its new listings.
    ///
    /// Report-writing and notifier failures are logged; the listings are already stored.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let report = self.orchestrator.run_pairs(self.pairs.clone(), cancel).await?;

        if let Some(dir) = &self.reports_dir {
            match write_cycle_report(dir, &report).await {
                Ok(path) => info!(path = %path.display(), "cycle report written"),
                Err(err) => warn!(error = %err, "writing cycle report failed"),
            }
        }

        if !report.new_listings.is_empty() {
            if let Err(err) = self.notifier.notify(&report.new_listings).await {
                error!(
                    channel = self.notifier.channel_name(),
                    error = %err,
                    new = report.new_count(),
                    "notification failed; new listings remain stored"
                );
            }
        }
        Ok(report)
    }

    pub async fn run_schedule(&self, interval: Duration, cancel: CancellationToken) -> LoopState {
        self.run_schedule_from(LoopState::default(), interval, cancel).await
    }

    /// Repeat `run_once` every `interval` until `cancel` fires.
    ///
    /// Cancellation is observed at the top of each iteration and during the
    /// sleep. A cycle already running finishes before the loop exits.
    pub async fn run_schedule_from(
        &self,
        mut state: LoopState,
        interval: Duration,
        cancel: CancellationToken,
    ) -> LoopState {
        info!(interval_secs = interval.as_secs(), pairs = self.pairs.len(), "scheduler starting");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            state.state = SchedulerState::Running;
            let started_at = Utc::now();
            match self.run_once(&cancel).await {
                Ok(report) => {
                    state.consecutive_failures = 0;
                    info!(new = report.new_count(), "cycle finished");
                }
                Err(err) => {
                    state.consecutive_failures += 1;
                    error!(
                        error = %err,
                        consecutive_failures = state.consecutive_failures,
                        "scan cycle failed; retrying next interval"
                    );
                }
            }
            state.cycles_run += 1;
            state.last_run_at = Some(started_at);

            state.state = SchedulerState::Sleeping;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        state.state = SchedulerState::Stopped;
        info!(cycles = state.cycles_run, "scheduler stopped");
        state
    }
}
