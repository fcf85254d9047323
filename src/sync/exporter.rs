//! Project rows -> sync tree.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::layout::{write_json, Manifest, SyncTree, FORMAT_VERSION};
use super::report::ExportSummary;
use crate::error::SyncError;
use crate::model::EntityKind;
use crate::store::ProjectStore;

pub struct Exporter<'a, S: ProjectStore + ?Sized> {
    store: &'a S,
    attachments_dir: PathBuf,
}

impl<'a, S: ProjectStore + ?Sized> Exporter<'a, S> {
    pub fn new(store: &'a S, attachments_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            attachments_dir: attachments_dir.into(),
        }
    }

    /// Write every live row of the project into `tree`, removing files for rows
    /// that no longer exist.
    #[instrument(skip(self, tree), fields(root = %tree.root().display()))]
    pub async fn export(&self, project_id: i64, tree: &SyncTree) -> Result<ExportSummary> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or(SyncError::ProjectNotFound(project_id))?;

        let sections = self.store.list_sections(project_id).await?;
        let test_cases = self.store.list_test_cases(project_id).await?;
        let test_plans = self.store.list_test_plans(project_id).await?;
        let test_runs = self.store.list_test_runs(project_id).await?;
        let attachments = self.store.list_attachments(project_id).await?;

        tree.ensure_dirs()?;
        let mut summary = ExportSummary::default();

        self.write_kind(tree, EntityKind::Section, &sections, |s| s.id, &mut summary)?;
        self.write_kind(tree, EntityKind::TestCase, &test_cases, |c| c.id, &mut summary)?;
        self.write_kind(tree, EntityKind::TestPlan, &test_plans, |p| p.id, &mut summary)?;
        self.write_kind(tree, EntityKind::TestRun, &test_runs, |r| r.id, &mut summary)?;
        self.write_kind(tree, EntityKind::Attachment, &attachments, |a| a.id, &mut summary)?;

        // Binary copies of attachments
        let mut expected_blobs = BTreeSet::new();
        for attachment in &attachments {
            let file_name = SyncTree::blob_file_name(attachment.id, &attachment.original_name);
            let target = tree.blob_dir().join(&file_name);
            expected_blobs.insert(file_name);

            let source = self.attachments_dir.join(&attachment.stored_name);
            match copy_if_changed(&source, &target) {
                Ok(true) => summary.files_written += 1,
                Ok(false) => {}
                Err(err) if !source.exists() => {
                    warn!(
                        attachment_id = attachment.id,
                        source = %source.display(),
                        "Attachment binary missing, exporting metadata only: {}",
                        err
                    );
                    summary.missing_binaries += 1;
                }
                Err(err) => return Err(err),
            }
        }

        for (name, path) in tree.list_blob_files()? {
            if !expected_blobs.contains(&name) {
                debug!(path = %path.display(), "Removing stale attachment binary");
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                summary.files_removed += 1;
            }
        }

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            project,
            counts: summary.counts.clone(),
        };
        if write_json(&tree.manifest_path(), &manifest)? {
            summary.files_written += 1;
        }

        info!(
            project_id,
            files_written = summary.files_written,
            files_removed = summary.files_removed,
            missing_binaries = summary.missing_binaries,
            "Export finished"
        );
        Ok(summary)
    }

    fn write_kind<T, F>(
        &self,
        tree: &SyncTree,
        kind: EntityKind,
        rows: &[T],
        id_of: F,
        summary: &mut ExportSummary,
    ) -> Result<()>
    where
        T: Serialize,
        F: Fn(&T) -> i64,
    {
        let mut live = BTreeSet::new();
        for row in rows {
            let id = id_of(row);
            live.insert(id);
            if write_json(&tree.entity_path(kind, id), row)? {
                summary.files_written += 1;
            }
        }

        for (id, path) in tree.list_entity_files(kind)? {
            if !live.contains(&id) {
                debug!(%kind, id, "Removing file for deleted row");
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                summary.files_removed += 1;
            }
        }

        summary.counts.insert(kind, rows.len());
        Ok(())
    }
}

/// Copy `source` to `target` unless the target already has identical bytes.
pub(crate) fn copy_if_changed(source: &Path, target: &Path) -> Result<bool> {
    let bytes =
        std::fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;

    if let Ok(existing) = std::fs::read(target) {
        if existing == bytes {
            return Ok(false);
        }
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(target, &bytes)
        .with_context(|| format!("failed to write {}", target.display()))?;
    Ok(true)
}
