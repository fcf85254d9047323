//! Git side of project sync: the working-directory repository, remotes with
//! token injection, and conflict resolution.

mod conflict;
mod remote;
mod repository;
pub mod types;

pub use conflict::{
    choose_side, resolve_index, ConflictPolicy, ConflictReport, ConflictSide, ResolvedConflict,
};
pub use remote::{inject_token, redact_url, RemoteSpec};
pub use repository::{SyncRepository, ORIGIN};
pub use types::{CommitAuthor, ReconcileOutcome, Reconciliation, RepoStatus};

use anyhow::{Context, Result};
use std::time::Duration;

use crate::error::SyncError;

/// Run blocking git work on the blocking pool, bounded by `timeout`. An
/// expired step is reported as [`SyncError::Timeout`]; the thread itself runs
/// to completion in the background.
pub async fn run_blocking<T, F>(step: &str, timeout: Duration, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(task);
    match tokio::time::timeout(timeout, handle).await {
        Ok(joined) => joined.with_context(|| format!("git {step} task panicked"))?,
        Err(_) => Err(SyncError::Timeout {
            step: step.to_string(),
            timeout,
        }
        .into()),
    }
}
