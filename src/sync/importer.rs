//! Sync tree -> project rows.
//!
//! Rows are upserted parents first (sections, then cases, plans, runs and
//! attachments) so every foreign key can be rewritten to the id the target
//! store actually assigned.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::layout::{read_json, Manifest, SyncTree, FORMAT_VERSION};
use super::ordering::order_sections;
use super::report::ImportSummary;
use crate::error::SyncError;
use crate::model::{Attachment, EntityKind, Project, Section, TestCase, TestPlan, TestRun};
use crate::store::{MemoryProjectStore, ProjectStore};
use crate::types::SanitizedFileName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Remove local rows of each kind that are absent from the tree
    pub delete_missing: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            delete_missing: true,
        }
    }
}

/// Exported id -> local id for one entity kind.
#[derive(Debug, Default)]
struct IdMap {
    ids: HashMap<i64, i64>,
    /// Local ids written by this import
    claimed: HashSet<i64>,
}

impl IdMap {
    fn insert(&mut self, exported: i64, local: i64) {
        self.ids.insert(exported, local);
        self.claimed.insert(local);
    }

    /// Id to hand the store for an exported row. When an earlier row of this
    /// import already landed on that local id, 0 asks for a fresh one instead
    /// of updating the row just written.
    fn target(&self, exported: i64) -> i64 {
        if self.claimed.contains(&exported) {
            0
        } else {
            exported
        }
    }

    fn get(&self, exported: i64) -> Option<i64> {
        self.ids.get(&exported).copied()
    }

    fn local_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.ids.values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Rewrite an optional reference, counting references that cannot be resolved.
    fn remap_optional(&self, reference: Option<i64>, dangling: &mut usize) -> Option<i64> {
        let exported = reference?;
        let local = self.get(exported);
        if local.is_none() {
            *dangling += 1;
        }
        local
    }
}

/// Everything read from the tree before any row is written.
struct TreeContents {
    sections: Vec<Section>,
    test_cases: Vec<TestCase>,
    test_plans: Vec<TestPlan>,
    test_runs: Vec<TestRun>,
    attachments: Vec<Attachment>,
}

pub struct Importer<'a, S: ProjectStore + ?Sized> {
    store: &'a S,
    attachments_dir: PathBuf,
    options: ImportOptions,
}

impl<'a, S: ProjectStore + ?Sized> Importer<'a, S> {
    pub fn new(store: &'a S, attachments_dir: impl Into<PathBuf>, options: ImportOptions) -> Self {
        Self {
            store,
            attachments_dir: attachments_dir.into(),
            options,
        }
    }

    /// Load `tree` into `project_id`. The tree is fully parsed and the section
    /// hierarchy checked before the first write.
    #[instrument(skip(self, tree), fields(root = %tree.root().display()))]
    pub async fn import(&self, project_id: i64, tree: &SyncTree) -> Result<ImportSummary> {
        if self.store.get_project(project_id).await?.is_none() {
            return Err(SyncError::ProjectNotFound(project_id).into());
        }

        let manifest_path = tree.manifest_path();
        if !manifest_path.exists() {
            bail!("no exported project at {}", tree.root().display());
        }
        let manifest: Manifest = read_json(&manifest_path)?;
        if manifest.format_version > FORMAT_VERSION {
            bail!(
                "{} uses format version {}, newest supported is {}",
                manifest_path.display(),
                manifest.format_version,
                FORMAT_VERSION
            );
        }
        if manifest.project.id != project_id {
            debug!(
                exported_project = manifest.project.id,
                project_id, "Importing tree exported from another project"
            );
        }

        let contents = TreeContents {
            sections: load_kind(tree, EntityKind::Section)?,
            test_cases: load_kind(tree, EntityKind::TestCase)?,
            test_plans: load_kind(tree, EntityKind::TestPlan)?,
            test_runs: load_kind(tree, EntityKind::TestRun)?,
            attachments: load_kind(tree, EntityKind::Attachment)?,
        };
        let ordered_sections = order_sections(&contents.sections)?;

        let mut summary = ImportSummary::default();
        let mut maps: BTreeMap<EntityKind, IdMap> = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, IdMap::default()))
            .collect();

        // Sections, parents before children
        for section in ordered_sections {
            let mut row = section.clone();
            row.id = maps[&EntityKind::Section].target(section.id);
            row.project_id = project_id;
            row.parent_id = maps[&EntityKind::Section]
                .remap_optional(section.parent_id, &mut summary.dangling_references);

            let local = self.store.upsert_section(project_id, &row).await?;
            self.record(&mut maps, &mut summary, EntityKind::Section, section.id, local);
        }

        for case in &contents.test_cases {
            let mut row = case.clone();
            row.id = maps[&EntityKind::TestCase].target(case.id);
            row.project_id = project_id;
            row.section_id = maps[&EntityKind::Section]
                .remap_optional(case.section_id, &mut summary.dangling_references);

            let local = self.store.upsert_test_case(project_id, &row).await?;
            self.record(&mut maps, &mut summary, EntityKind::TestCase, case.id, local);
        }

        for plan in &contents.test_plans {
            let mut row = plan.clone();
            row.id = maps[&EntityKind::TestPlan].target(plan.id);
            row.project_id = project_id;
            row.test_case_ids = remap_list(
                &maps[&EntityKind::TestCase],
                &plan.test_case_ids,
                &mut summary.dangling_references,
            );

            let local = self.store.upsert_test_plan(project_id, &row).await?;
            self.record(&mut maps, &mut summary, EntityKind::TestPlan, plan.id, local);
        }

        for run in &contents.test_runs {
            let mut row = run.clone();
            row.id = maps[&EntityKind::TestRun].target(run.id);
            row.project_id = project_id;
            row.plan_id = maps[&EntityKind::TestPlan]
                .remap_optional(run.plan_id, &mut summary.dangling_references);

            let cases = &maps[&EntityKind::TestCase];
            row.results = run
                .results
                .iter()
                .filter_map(|result| match cases.get(result.test_case_id) {
                    Some(local) => {
                        let mut result = result.clone();
                        result.test_case_id = local;
                        Some(result)
                    }
                    None => {
                        summary.dangling_references += 1;
                        None
                    }
                })
                .collect();

            let local = self.store.upsert_test_run(project_id, &row).await?;
            self.record(&mut maps, &mut summary, EntityKind::TestRun, run.id, local);
        }

        // Attachments need the rows already in the store to decide whether a
        // binary can be reused.
        let existing: HashMap<i64, Attachment> = self
            .store
            .list_attachments(project_id)
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();

        for attachment in &contents.attachments {
            let mut row = attachment.clone();
            row.id = maps[&EntityKind::Attachment].target(attachment.id);
            row.project_id = project_id;
            row.test_case_id = maps[&EntityKind::TestCase]
                .remap_optional(attachment.test_case_id, &mut summary.dangling_references);

            let previous = existing.get(&row.id);
            let replaced = self.place_binary(tree, attachment, previous, &mut row, &mut summary)?;

            let local = self.store.upsert_attachment(project_id, &row).await?;
            self.record(&mut maps, &mut summary, EntityKind::Attachment, attachment.id, local);

            // Old binary goes only after the row points at the new one
            if let Some(old) = replaced {
                self.remove_binary(&old, &mut summary)?;
            }
        }

        if self.options.delete_missing {
            self.delete_missing(project_id, &maps, &mut summary).await?;
        }

        info!(
            project_id,
            upserted = summary.total_upserted(),
            deleted = summary.total_deleted(),
            remapped_ids = summary.remapped_ids,
            dangling_references = summary.dangling_references,
            "Import finished"
        );
        Ok(summary)
    }

    fn record(
        &self,
        maps: &mut BTreeMap<EntityKind, IdMap>,
        summary: &mut ImportSummary,
        kind: EntityKind,
        exported: i64,
        local: i64,
    ) {
        if exported != local {
            debug!(%kind, exported, local, "Remapped id");
            summary.remapped_ids += 1;
        }
        if let Some(map) = maps.get_mut(&kind) {
            map.insert(exported, local);
        }
        *summary.upserted.entry(kind).or_default() += 1;
    }

    /// Point `row.stored_name` at a binary holding the tree's bytes. Returns
    /// the previously stored name when it is being replaced.
    fn place_binary(
        &self,
        tree: &SyncTree,
        attachment: &Attachment,
        previous: Option<&Attachment>,
        row: &mut Attachment,
        summary: &mut ImportSummary,
    ) -> Result<Option<String>> {
        let blob = tree.blob_path(attachment.id, &attachment.original_name);
        if !blob.exists() {
            warn!(
                attachment_id = attachment.id,
                path = %blob.display(),
                "Attachment binary missing from tree, importing metadata only"
            );
            if let Some(previous) = previous {
                row.stored_name = previous.stored_name.clone();
            }
            return Ok(None);
        }

        let bytes =
            std::fs::read(&blob).with_context(|| format!("failed to read {}", blob.display()))?;
        row.size_bytes = bytes.len() as i64;

        if let Some(previous) = previous {
            let current = self.attachments_dir.join(&previous.stored_name);
            if std::fs::read(&current).is_ok_and(|existing| existing == bytes) {
                row.stored_name = previous.stored_name.clone();
                return Ok(None);
            }
        }

        let stored_name = format!(
            "{}-{}",
            Uuid::new_v4(),
            SanitizedFileName::new(&attachment.original_name)
        );
        std::fs::create_dir_all(&self.attachments_dir)
            .with_context(|| format!("failed to create {}", self.attachments_dir.display()))?;
        let target = self.attachments_dir.join(&stored_name);
        std::fs::write(&target, &bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
        summary.binaries_copied += 1;
        row.stored_name = stored_name;

        Ok(previous.map(|p| p.stored_name.clone()))
    }

    fn remove_binary(&self, stored_name: &str, summary: &mut ImportSummary) -> Result<()> {
        let path = self.attachments_dir.join(stored_name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                summary.binaries_removed += 1;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    async fn delete_missing(
        &self,
        project_id: i64,
        maps: &BTreeMap<EntityKind, IdMap>,
        summary: &mut ImportSummary,
    ) -> Result<()> {
        for kind in EntityKind::ALL {
            let keep = maps.get(&kind).map(IdMap::local_ids).unwrap_or_default();

            if kind.supports_soft_delete() {
                let deleted = self.store.soft_delete_missing(project_id, kind, &keep).await?;
                if deleted > 0 {
                    debug!(%kind, deleted, "Soft-deleted rows absent from import");
                }
                summary.deleted.insert(kind, deleted);
                continue;
            }

            let removed = self.store.delete_missing_attachments(project_id, &keep).await?;
            let kept_names: HashSet<String> = self
                .store
                .list_attachments(project_id)
                .await?
                .into_iter()
                .map(|a| a.stored_name)
                .collect();
            for attachment in &removed {
                if !kept_names.contains(&attachment.stored_name) {
                    self.remove_binary(&attachment.stored_name, summary)?;
                }
            }
            summary.deleted.insert(kind, removed.len() as u64);
        }
        Ok(())
    }
}

/// Import `tree` into a throwaway in-memory store that holds only the
/// manifest's project and report what a real import would do. Binaries land
/// in a temporary directory removed on return.
pub async fn preview_import(
    tree: &SyncTree,
    project_id: i64,
    options: ImportOptions,
) -> Result<ImportSummary> {
    let manifest: Manifest = read_json(&tree.manifest_path())
        .with_context(|| format!("no exported project in {}", tree.root().display()))?;

    let store = MemoryProjectStore::new();
    store
        .put_project(Project {
            id: project_id,
            ..manifest.project
        })
        .await;

    let scratch = tempfile::Builder::new()
        .prefix("casesync-preview-")
        .tempdir()
        .context("failed to create scratch directory")?;
    Importer::new(&store, scratch.path(), options)
        .import(project_id, tree)
        .await
}

fn remap_list(map: &IdMap, ids: &[i64], dangling: &mut usize) -> Vec<i64> {
    ids.iter()
        .filter_map(|&id| {
            let local = map.get(id);
            if local.is_none() {
                *dangling += 1;
            }
            local
        })
        .collect()
}

fn load_kind<T: DeserializeOwned>(tree: &SyncTree, kind: EntityKind) -> Result<Vec<T>> {
    tree.list_entity_files(kind)?
        .values()
        .map(|path| read_json(path))
        .collect()
}
