//! Per-project sync orchestration.
//!
//! Each public operation takes the project's lock, so two requests for the
//! same project never touch its working directory at once while different
//! projects proceed in parallel.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use super::exporter::Exporter;
use super::importer::{ImportOptions, Importer};
use super::layout::SyncTree;
use super::report::{ExportSummary, ImportSummary, SyncReport, SyncStatus};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::git::{
    run_blocking, CommitAuthor, Reconciliation, RemoteSpec, RepoStatus, SyncRepository,
};
use crate::model::{GitSettings, GitSettingsUpdate, GitSettingsView};
use crate::observability::{log_operation, with_trace_id, Operation, OperationContext};
use crate::store::ProjectStore;
use crate::types::{ValidatedBranchName, ValidatedProjectId, ValidatedRemoteUrl};
use crate::validation::author::validate_author;

/// Held for the whole of an operation and by any git task it started, so a
/// task that outlived its timeout still keeps the project locked.
type ProjectGuard = Arc<OwnedMutexGuard<()>>;

pub struct SyncService<S: ?Sized> {
    store: Arc<S>,
    config: SyncConfig,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

/// Which steps a push, pull or sync runs around fetch + reconcile.
#[derive(Debug, Clone, Copy)]
struct Steps {
    export: bool,
    import: bool,
    push: bool,
}

impl<S: ProjectStore + ?Sized> SyncService<S> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The sync tree (working directory) of a project
    pub fn tree(&self, project_id: i64) -> SyncTree {
        SyncTree::for_project(&self.config.work_dir, project_id)
    }

    async fn lock_project(&self, project_id: i64) -> ProjectGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(project_id).or_default().clone()
        };
        Arc::new(lock.lock_owned().await)
    }

    /// Blocking git work under the project lock, bounded by `git_timeout`.
    async fn git<T, F>(&self, guard: &ProjectGuard, step: &str, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let held = Arc::clone(guard);
        run_blocking(step, self.config.git_timeout, move || {
            let _held = held;
            task()
        })
        .await
    }

    /// Stored settings, or defaults for a project that was never configured.
    async fn settings(&self, project_id: i64) -> Result<GitSettings> {
        ValidatedProjectId::new(project_id)?;
        if self.store.get_project(project_id).await?.is_none() {
            return Err(SyncError::ProjectNotFound(project_id).into());
        }
        Ok(self
            .store
            .get_git_settings(project_id)
            .await?
            .unwrap_or_else(|| GitSettings::new(project_id, &self.config.default_branch)))
    }

    fn repository(&self, settings: &GitSettings) -> SyncRepository {
        SyncRepository::new(self.tree(settings.project_id).root(), &settings.branch)
            .with_transfer_timeout(self.config.git_timeout)
    }

    fn remote(&self, settings: &GitSettings) -> Result<RemoteSpec> {
        let url = settings
            .remote_url
            .clone()
            .ok_or(SyncError::NotConfigured(settings.project_id))?;
        Ok(RemoteSpec::new(url, settings.access_token.clone()))
    }

    fn author(&self, settings: &GitSettings) -> CommitAuthor {
        CommitAuthor::new(
            settings
                .author_name
                .clone()
                .unwrap_or_else(|| self.config.author_name.clone()),
            settings
                .author_email
                .clone()
                .unwrap_or_else(|| self.config.author_email.clone()),
        )
    }

    pub async fn get_settings(&self, project_id: i64) -> Result<GitSettingsView> {
        Ok(self.settings(project_id).await?.view())
    }

    /// Validate and persist a settings update. `Some("")` clears an optional
    /// field; an empty branch goes back to the default branch.
    #[instrument(skip(self, update))]
    pub async fn configure(
        &self,
        project_id: i64,
        update: GitSettingsUpdate,
    ) -> Result<GitSettingsView> {
        let _guard = self.lock_project(project_id).await;
        let mut settings = self.settings(project_id).await?;

        if let Some(url) = update.remote_url {
            let url = url.trim();
            settings.remote_url = if url.is_empty() {
                None
            } else {
                let url = ValidatedRemoteUrl::new(url).map_err(invalid_settings)?;
                Some(url.as_str().to_string())
            };
        }

        if let Some(branch) = update.branch {
            let branch = branch.trim();
            settings.branch = if branch.is_empty() {
                self.config.default_branch.clone()
            } else {
                ValidatedBranchName::new(branch)
                    .map_err(invalid_settings)?
                    .as_str()
                    .to_string()
            };
        }

        if let Some(token) = update.access_token {
            settings.access_token = Some(token.trim().to_string()).filter(|t| !t.is_empty());
        }
        if let Some(name) = update.author_name {
            settings.author_name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
        }
        if let Some(email) = update.author_email {
            settings.author_email = Some(email.trim().to_string()).filter(|e| !e.is_empty());
        }

        let author = self.author(&settings);
        validate_author(&author.name, &author.email).map_err(invalid_settings)?;

        if settings.access_token.is_some() {
            let https = settings
                .remote_url
                .as_deref()
                .and_then(|url| ValidatedRemoteUrl::new(url).ok())
                .is_some_and(|url| url.is_https());
            if !https {
                warn!(project_id, "Access token is only used with HTTPS remotes");
            }
        }

        self.store.save_git_settings(&settings).await?;
        info!(project_id, branch = %settings.branch, "Saved git settings");
        Ok(settings.view())
    }

    /// Create the working directory: clone when a remote is configured,
    /// otherwise an empty repository.
    #[instrument(skip(self))]
    pub async fn init(&self, project_id: i64) -> Result<RepoStatus> {
        with_trace_id("git.init", async {
            let guard = self.lock_project(project_id).await;
            let settings = self.settings(project_id).await?;
            self.prepare_repository(&guard, &settings).await?;

            let repo = self.repository(&settings);
            self.git(&guard, "status", move || repo.status()).await
        })
        .await
    }

    /// Write the project's rows into its working directory. No git involved.
    #[instrument(skip(self))]
    pub async fn export(&self, project_id: i64) -> Result<ExportSummary> {
        with_trace_id("git.export", async {
            let _guard = self.lock_project(project_id).await;
            let ctx = OperationContext::new("export");
            self.settings(project_id).await?;
            self.export_tree(&ctx, project_id).await
        })
        .await
    }

    /// Load the project's working directory into the store. No git involved.
    #[instrument(skip(self))]
    pub async fn import(&self, project_id: i64, options: ImportOptions) -> Result<ImportSummary> {
        with_trace_id("git.import", async {
            let _guard = self.lock_project(project_id).await;
            let ctx = OperationContext::new("import");
            self.settings(project_id).await?;
            self.import_tree(&ctx, project_id, options).await
        })
        .await
    }

    /// Export, commit, fetch, reconcile and push.
    #[instrument(skip(self))]
    pub async fn push(&self, project_id: i64) -> Result<SyncReport> {
        let steps = Steps {
            export: true,
            import: false,
            push: true,
        };
        with_trace_id("git.push", self.run(project_id, "push", steps)).await
    }

    /// Fetch, reconcile and import. Uncommitted edits in the working
    /// directory are committed first so the reconcile sees them. A pull counts
    /// as a sync for `last_sync_at`.
    #[instrument(skip(self))]
    pub async fn pull(&self, project_id: i64) -> Result<SyncReport> {
        let steps = Steps {
            export: false,
            import: true,
            push: false,
        };
        with_trace_id("git.pull", self.run(project_id, "pull", steps)).await
    }

    /// Export, commit, fetch, reconcile, import and push.
    #[instrument(skip(self))]
    pub async fn sync(&self, project_id: i64) -> Result<SyncReport> {
        let steps = Steps {
            export: true,
            import: true,
            push: true,
        };
        with_trace_id("git.sync", self.run(project_id, "sync", steps)).await
    }

    pub async fn status(&self, project_id: i64) -> Result<SyncStatus> {
        let guard = self.lock_project(project_id).await;
        let settings = self.settings(project_id).await?;
        let repo = self.repository(&settings);

        let repository = if repo.exists() {
            Some(self.git(&guard, "status", move || repo.status()).await?)
        } else {
            None
        };

        Ok(SyncStatus {
            project_id,
            settings: settings.view(),
            repository,
        })
    }

    async fn run(&self, project_id: i64, operation: &str, steps: Steps) -> Result<SyncReport> {
        let guard = self.lock_project(project_id).await;
        let ctx = OperationContext::new(operation);
        let settings = self.settings(project_id).await?;
        let remote = self.remote(&settings)?;
        let author = self.author(&settings);
        let mut report = SyncReport::new(project_id);

        self.prepare_repository(&guard, &settings).await?;
        let repo = self.repository(&settings);

        let first_sync = settings.last_sync_at.is_none();
        if first_sync && steps.export && self.tree(project_id).manifest_path().exists() {
            // The checkout holds rows this database has never seen and says
            // nothing about what it deleted, so merge them in before exporting
            // over them.
            let options = ImportOptions {
                delete_missing: false,
            };
            report.import = Some(self.import_tree(&ctx, project_id, options).await?);
        }

        if steps.export {
            report.export = Some(self.export_tree(&ctx, project_id).await?);
        }

        let message = if steps.export {
            format!("Export project {project_id}")
        } else {
            format!("Local changes to project {project_id}")
        };
        let step = ctx.child("commit");
        let committed = {
            let (repo, author) = (repo.clone(), author.clone());
            self.git(&guard, "commit", move || repo.commit_all(&message, &author)).await
        };
        log_operation(
            &step,
            &Operation::Commit {
                project_id,
                commit: committed.as_ref().ok().cloned().flatten(),
            },
            &step_result(&committed),
        );
        report.commit = committed?;

        {
            let (repo, remote) = (repo.clone(), remote.clone());
            self.git(&guard, "fetch", move || repo.fetch(&remote)).await?;
        }

        let policy = self.config.conflict_policy;
        let step = ctx.child("reconcile");
        let reconciled = {
            let (repo, author) = (repo.clone(), author.clone());
            self.git(&guard, "reconcile", move || repo.reconcile(policy, &author))
                .await
        };
        let (outcome, resolved) = match &reconciled {
            Ok(r) => (r.outcome.to_string(), r.conflicts.resolved.len()),
            Err(_) => ("failed".to_string(), 0),
        };
        log_operation(
            &step,
            &Operation::Reconcile {
                project_id,
                outcome,
                conflicts: resolved,
            },
            &step_result(&reconciled),
        );
        let Reconciliation { outcome, conflicts } = reconciled?;
        report.reconcile = Some(outcome);
        report.conflicts = conflicts;

        if steps.import {
            if self.tree(project_id).manifest_path().exists() {
                let options = ImportOptions {
                    delete_missing: self.config.delete_missing,
                };
                report.import = Some(self.import_tree(&ctx, project_id, options).await?);
            } else {
                info!(project_id, "Nothing exported on the remote yet, skipping import");
            }
        }

        if steps.push {
            let step = ctx.child("push");
            let pushed = {
                let (repo, remote) = (repo.clone(), remote.clone());
                self.git(&guard, "push", move || repo.push(&remote)).await
            };
            log_operation(
                &step,
                &Operation::Push {
                    project_id,
                    branch: settings.branch.clone(),
                },
                &step_result(&pushed),
            );
            report.head = Some(pushed?);
            report.pushed = true;
        } else {
            let status = self.git(&guard, "status", move || repo.status()).await?;
            report.head = status.head;
        }

        self.store
            .record_sync(project_id, report.head.as_deref(), Utc::now())
            .await?;

        info!(
            project_id,
            commit = ?report.commit,
            head = ?report.head,
            pushed = report.pushed,
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "Sync finished"
        );
        Ok(report)
    }

    /// Open, init or clone the working directory and point `origin` at the
    /// configured remote.
    async fn prepare_repository(&self, guard: &ProjectGuard, settings: &GitSettings) -> Result<()> {
        let repo = self.repository(settings);

        match settings.remote_url.as_ref() {
            Some(_) if !repo.exists() => {
                let remote = self.remote(settings)?;
                self.git(guard, "clone", move || repo.clone_remote(&remote)).await?;
            }
            Some(url) => {
                let url = url.clone();
                self.git(guard, "init", move || {
                    repo.open_or_init()?;
                    repo.set_remote(&url)
                })
                .await?;
            }
            None => {
                self.git(guard, "init", move || repo.open_or_init()).await?;
            }
        }
        Ok(())
    }

    async fn export_tree(&self, ctx: &OperationContext, project_id: i64) -> Result<ExportSummary> {
        let step = ctx.child("export");
        let tree = self.tree(project_id);
        let exported = Exporter::new(self.store.as_ref(), &self.config.attachments_dir)
            .export(project_id, &tree)
            .await;
        let summary = exported.as_ref().ok().cloned().unwrap_or_default();
        log_operation(
            &step,
            &Operation::Export {
                project_id,
                files_written: summary.files_written,
                files_removed: summary.files_removed,
            },
            &step_result(&exported),
        );
        exported
    }

    async fn import_tree(
        &self,
        ctx: &OperationContext,
        project_id: i64,
        options: ImportOptions,
    ) -> Result<ImportSummary> {
        let step = ctx.child("import");
        let tree = self.tree(project_id);
        let imported = Importer::new(self.store.as_ref(), &self.config.attachments_dir, options)
            .import(project_id, &tree)
            .await;
        let (rows_upserted, rows_deleted) = imported
            .as_ref()
            .map(|s| (s.total_upserted(), s.total_deleted()))
            .unwrap_or_default();
        log_operation(
            &step,
            &Operation::Import {
                project_id,
                rows_upserted,
                rows_deleted,
            },
            &step_result(&imported),
        );
        imported
    }
}

/// A step's outcome for [`log_operation`], which only needs success or the message.
fn step_result<T>(result: &Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) => Err(anyhow::anyhow!("{err:#}")),
    }
}

fn invalid_settings(err: anyhow::Error) -> anyhow::Error {
    SyncError::InvalidSettings(format!("{err:#}")).into()
}
