//! Result types returned by the exporter, importer and sync service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::git::{ConflictReport, ReconcileOutcome, RepoStatus};
use crate::model::{EntityKind, GitSettingsView};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    /// Rows exported per kind
    pub counts: BTreeMap<EntityKind, usize>,
    pub files_written: usize,
    pub files_removed: usize,
    /// Attachments whose stored binary could not be found
    pub missing_binaries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub upserted: BTreeMap<EntityKind, usize>,
    pub deleted: BTreeMap<EntityKind, u64>,
    /// Rows whose local id differs from the id in the tree
    pub remapped_ids: usize,
    /// References to rows that are not part of the import, dropped
    pub dangling_references: usize,
    pub binaries_copied: usize,
    pub binaries_removed: usize,
}

impl ImportSummary {
    pub fn total_upserted(&self) -> usize {
        self.upserted.values().sum()
    }

    pub fn total_deleted(&self) -> u64 {
        self.deleted.values().sum()
    }
}

/// Everything a push, pull or sync did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub project_id: i64,
    pub export: Option<ExportSummary>,
    pub import: Option<ImportSummary>,
    /// Commit created from the export, if the tree changed
    pub commit: Option<String>,
    pub reconcile: Option<ReconcileOutcome>,
    pub conflicts: ConflictReport,
    pub pushed: bool,
    /// Branch head after the operation
    pub head: Option<String>,
}

impl SyncReport {
    pub fn new(project_id: i64) -> Self {
        Self {
            project_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub project_id: i64,
    pub settings: GitSettingsView,
    /// `None` until the working directory has been initialized
    pub repository: Option<RepoStatus>,
}
