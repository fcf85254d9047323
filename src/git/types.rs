//! Git-specific types and data structures

use serde::{Deserialize, Serialize};
use std::fmt;

use super::conflict::ConflictReport;

/// Identity used for commits made by the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl CommitAuthor {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    pub(crate) fn signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

/// How the fetched remote head was integrated into the local branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The remote has no commits on the branch yet
    RemoteEmpty,
    UpToDate,
    FastForward { head: String },
    /// Local commits were replayed on top of the remote head
    Rebased { head: String, replayed: usize },
    /// Rebase could not be completed; a merge commit joins both histories
    Merged { head: String },
}

impl ReconcileOutcome {
    /// Whether the working tree now differs from before the reconcile
    pub fn changed_tree(&self) -> bool {
        !matches!(self, ReconcileOutcome::RemoteEmpty | ReconcileOutcome::UpToDate)
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::RemoteEmpty => f.write_str("remote_empty"),
            ReconcileOutcome::UpToDate => f.write_str("up_to_date"),
            ReconcileOutcome::FastForward { .. } => f.write_str("fast_forward"),
            ReconcileOutcome::Rebased { .. } => f.write_str("rebased"),
            ReconcileOutcome::Merged { .. } => f.write_str("merged"),
        }
    }
}

/// Result of integrating the remote head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub outcome: ReconcileOutcome,
    pub conflicts: ConflictReport,
}

/// Snapshot of a project working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub branch: String,
    /// `None` before the first commit
    pub head: Option<String>,
    /// Last fetched remote head
    pub remote_head: Option<String>,
    /// Local commits not on the remote
    pub ahead: usize,
    /// Remote commits not yet integrated
    pub behind: usize,
    /// Paths with uncommitted changes
    pub dirty: Vec<String>,
    /// `origin` as stored in the repository config
    pub remote_url: Option<String>,
}
