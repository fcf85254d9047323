// Logging setup and per-step accounting for sync runs

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const DEFAULT_FILTER: &str = "casesync=warn,error";
const VERBOSE_FILTER: &str = "casesync=debug,info";
const QUIET_FILTER: &str = "error";

/// Process-wide step counters, exposed through `/health`
struct StepCounters {
    steps: AtomicU64,
    failures: AtomicU64,
    exports: AtomicU64,
    imports: AtomicU64,
    commits: AtomicU64,
    reconciles: AtomicU64,
    conflicts_resolved: AtomicU64,
    pushes: AtomicU64,
}

static COUNTERS: StepCounters = StepCounters {
    steps: AtomicU64::new(0),
    failures: AtomicU64::new(0),
    exports: AtomicU64::new(0),
    imports: AtomicU64::new(0),
    commits: AtomicU64::new(0),
    reconciles: AtomicU64::new(0),
    conflicts_resolved: AtomicU64::new(0),
    pushes: AtomicU64::new(0),
};

pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Install the global subscriber. `--verbose` raises casesync to DEBUG,
/// `--quiet` drops everything below ERROR. Calling it twice is harmless.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let env_filter = build_filter(verbose, quiet, std::env::var("RUST_LOG").ok().as_deref());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_line_number(verbose)
        .with_file(verbose)
        .with_ansi(true);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        info!(verbose, "casesync logging initialized");
    }
    Ok(())
}

/// Quiet always wins over RUST_LOG; otherwise RUST_LOG overrides the flag-based default.
fn build_filter(verbose: bool, quiet: bool, rust_log: Option<&str>) -> EnvFilter {
    if quiet {
        return EnvFilter::new(QUIET_FILTER);
    }

    let flag_filter = if verbose {
        VERBOSE_FILTER
    } else {
        DEFAULT_FILTER
    };

    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(flag_filter))
}

/// One step of a sync run, as it appears in the logs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Operation {
    Export {
        project_id: i64,
        files_written: usize,
        files_removed: usize,
    },
    Import {
        project_id: i64,
        rows_upserted: usize,
        rows_deleted: u64,
    },
    Commit {
        project_id: i64,
        commit: Option<String>,
    },
    Reconcile {
        project_id: i64,
        outcome: String,
        conflicts: usize,
    },
    Push {
        project_id: i64,
        branch: String,
    },
}

impl Operation {
    fn project_id(&self) -> i64 {
        match self {
            Operation::Export { project_id, .. }
            | Operation::Import { project_id, .. }
            | Operation::Commit { project_id, .. }
            | Operation::Reconcile { project_id, .. }
            | Operation::Push { project_id, .. } => *project_id,
        }
    }

    fn count(&self) {
        let counter = match self {
            Operation::Export { .. } => &COUNTERS.exports,
            Operation::Import { .. } => &COUNTERS.imports,
            Operation::Commit { commit: None, .. } => return,
            Operation::Commit { .. } => &COUNTERS.commits,
            Operation::Reconcile { conflicts, .. } => {
                COUNTERS
                    .conflicts_resolved
                    .fetch_add(*conflicts as u64, Ordering::Relaxed);
                &COUNTERS.reconciles
            }
            Operation::Push { .. } => &COUNTERS.pushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Ties the steps of one push, pull or sync together in the logs.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation: String,
    pub start_time: Instant,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            operation: operation.into(),
            start_time: Instant::now(),
        }
    }

    /// A step of this operation: same trace, new span.
    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            operation: operation.into(),
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[instrument(skip_all, fields(operation = %ctx.operation))]
pub fn log_operation(ctx: &OperationContext, op: &Operation, result: &Result<()>) {
    let elapsed_ms = ctx.elapsed().as_millis() as u64;
    COUNTERS.steps.fetch_add(1, Ordering::Relaxed);

    match result {
        Ok(()) => {
            op.count();
            info!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                project_id = op.project_id(),
                elapsed_ms,
                "Step finished: {:?}", op
            );
        }
        Err(e) => {
            COUNTERS.failures.fetch_add(1, Ordering::Relaxed);
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                project_id = op.project_id(),
                elapsed_ms,
                error = %e,
                "Step failed: {:?}", op
            );
        }
    }
}

/// Run `f` inside a span carrying a fresh trace id and log how it ended.
pub async fn with_trace_id<F, T>(operation: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let ctx = OperationContext::new(operation);
    let span = tracing::info_span!("sync", trace_id = %ctx.trace_id, operation);

    let result = f.instrument(span.clone()).await;
    let elapsed_ms = ctx.elapsed().as_millis() as u64;

    span.in_scope(|| match &result {
        Ok(_) => info!(elapsed_ms, "{operation} finished"),
        Err(e) => {
            COUNTERS.failures.fetch_add(1, Ordering::Relaxed);
            warn!(elapsed_ms, error = %format!("{e:#}"), "{operation} failed");
        }
    });

    result
}

/// Counter snapshot reported by `/health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub steps: u64,
    pub failures: u64,
    pub exports: u64,
    pub imports: u64,
    pub commits: u64,
    pub reconciles: u64,
    pub conflicts_resolved: u64,
    pub pushes: u64,
    pub timestamp: DateTime<Utc>,
}

pub fn get_metrics() -> SyncMetrics {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    SyncMetrics {
        steps: load(&COUNTERS.steps),
        failures: load(&COUNTERS.failures),
        exports: load(&COUNTERS.exports),
        imports: load(&COUNTERS.imports),
        commits: load(&COUNTERS.commits),
        reconciles: load(&COUNTERS.reconciles),
        conflicts_resolved: load(&COUNTERS.conflicts_resolved),
        pushes: load(&COUNTERS.pushes),
        timestamp: Utc::now(),
    }
}
