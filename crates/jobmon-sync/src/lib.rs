//! Scan cycle orchestration for jobmon.
//!
//! Config loading, keyword filtering, reconciliation against the job store,
//! the concurrent scan orchestrator and the interval scheduler.

mod config;
mod filter;
mod orchestrator;
mod reconcile;
mod report;
mod scheduler;

pub use config::{
    load_searches_file, CliOverrides, ConfigValidationError, MonitorConfig, SearchEntry,
    SearchPlan, SearchesFile,
};
pub use filter::{KeywordFilter, ListingFilter, PassThroughFilter};
pub use orchestrator::{CycleError, ScanOptions, ScanOrchestrator, ScanPair};
pub use reconcile::Reconciler;
pub use report::{render_brief, write_cycle_report};
pub use scheduler::{LoopState, Scheduler, SchedulerState};

pub const CRATE_NAME: &str = "jobmon-sync";
