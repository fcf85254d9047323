//! One project working directory under git.
//!
//! Every method is blocking libgit2 work and opens the repository afresh, so
//! a `SyncRepository` can be cloned into `spawn_blocking`.

use anyhow::{anyhow, Context, Result};
use git2::build::CheckoutBuilder;
use git2::{
    Commit, ErrorCode, FetchOptions, FileFavor, IndexAddOption, MergeOptions, Oid, PushOptions,
    RebaseOptions, Repository, RepositoryInitOptions, Status, StatusOptions,
};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::conflict::{resolve_index, ConflictPolicy, ConflictReport, ConflictSide};
use super::remote::{redact_url, RemoteSpec};
use super::types::{CommitAuthor, ReconcileOutcome, Reconciliation, RepoStatus};
use crate::error::SyncError;

pub const ORIGIN: &str = "origin";

const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct SyncRepository {
    path: PathBuf,
    branch: String,
    /// Fetches stop asking for more objects after this long
    transfer_timeout: Duration,
}

impl SyncRepository {
    pub fn new(path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            branch: branch.into(),
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Whether the working directory already holds a repository
    pub fn exists(&self) -> bool {
        self.path.join(".git").exists()
    }

    fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/{ORIGIN}/{}", self.branch)
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.path)
            .with_context(|| format!("failed to open git repository at {}", self.path.display()))
    }

    /// Open the working directory, creating an empty repository whose HEAD is
    /// the configured branch when there is none yet.
    #[instrument(skip(self), fields(path = %self.path.display(), branch = %self.branch))]
    pub fn open_or_init(&self) -> Result<()> {
        if self.exists() {
            let repo = self.open()?;
            return self.ensure_on_branch(&repo);
        }

        std::fs::create_dir_all(&self.path)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        let mut options = RepositoryInitOptions::new();
        options.initial_head(&self.branch);
        Repository::init_opts(&self.path, &options)
            .with_context(|| format!("failed to init git repository at {}", self.path.display()))?;

        info!("Initialized sync repository");
        Ok(())
    }

    /// Bring the working directory in line with `remote`: init if needed,
    /// point `origin` at it, fetch, and check out the remote branch when the
    /// local one has no commits. Returns whether the remote has the branch.
    #[instrument(skip(self, remote), fields(path = %self.path.display(), remote = %remote.display_url()))]
    pub fn clone_remote(&self, remote: &RemoteSpec) -> Result<bool> {
        self.open_or_init()?;
        self.set_remote(&remote.url)?;

        let Some(remote_head) = self.fetch(remote)? else {
            info!("Remote branch does not exist yet, starting from an empty repository");
            return Ok(false);
        };

        let repo = self.open()?;
        if head_commit(&repo)?.is_none() {
            let oid = Oid::from_str(&remote_head)?;
            self.move_branch(&repo, oid, "clone")?;
            info!(head = %remote_head, "Checked out remote branch");
        }
        Ok(true)
    }

    /// Point `origin` at `url`. The stored URL never carries credentials.
    pub fn set_remote(&self, url: &str) -> Result<()> {
        let repo = self.open()?;
        match repo.find_remote(ORIGIN) {
            Ok(existing) if existing.url() == Some(url) => {}
            Ok(_) => repo
                .remote_set_url(ORIGIN, url)
                .context("failed to update origin")?,
            Err(_) => {
                repo.remote(ORIGIN, url).context("failed to add origin")?;
            }
        }
        Ok(())
    }

    /// Stage everything, deletions included, and commit. Returns `None` when
    /// the staged tree is identical to HEAD's.
    #[instrument(skip(self, author), fields(path = %self.path.display()))]
    pub fn commit_all(&self, message: &str, author: &CommitAuthor) -> Result<Option<String>> {
        let repo = self.open()?;
        let mut index = repo.index().context("failed to open index")?;
        index
            .add_all(["*"], IndexAddOption::DEFAULT, None)
            .context("failed to stage changes")?;
        index
            .update_all(["*"], None)
            .context("failed to stage deletions")?;
        index.write().context("failed to write index")?;
        let tree_id = index.write_tree().context("failed to write tree")?;

        let parent = head_commit(&repo)?;
        match &parent {
            Some(parent) if parent.tree_id() == tree_id => {
                debug!("Nothing to commit");
                return Ok(None);
            }
            None if index.is_empty() => {
                debug!("Nothing to commit");
                return Ok(None);
            }
            _ => {}
        }

        let tree = repo.find_tree(tree_id)?;
        let signature = author.signature()?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .context("failed to create commit")?;

        info!(commit = %oid, "Committed changes");
        Ok(Some(oid.to_string()))
    }

    /// Fetch the branch into `refs/remotes/origin/<branch>`. Returns the
    /// remote head, or `None` when the remote has no such branch.
    #[instrument(skip(self, remote), fields(remote = %remote.display_url(), branch = %self.branch))]
    pub fn fetch(&self, remote: &RemoteSpec) -> Result<Option<String>> {
        let repo = self.open()?;
        let url = remote.authenticated_url()?;
        let mut anonymous = repo
            .remote_anonymous(&url)
            .map_err(|err| transfer_error(remote, "reach", err))?;

        let deadline = Instant::now() + self.transfer_timeout;
        let mut callbacks = remote.callbacks();
        callbacks.transfer_progress(move |_| Instant::now() < deadline);
        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);

        let refspec = format!("+{}:{}", self.local_ref(), self.remote_ref());
        anonymous
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(|err| transfer_error(remote, "fetch from", err))?;

        let head = repo.refname_to_id(&self.remote_ref()).ok();
        debug!(head = ?head, "Fetched");
        Ok(head.map(|oid| oid.to_string()))
    }

    /// Integrate the fetched remote head into the local branch. Diverged
    /// histories are rebased in memory; when a rebase step cannot be settled
    /// the rebase is dropped and the two heads are merged instead.
    #[instrument(skip(self, author), fields(path = %self.path.display(), %policy))]
    pub fn reconcile(&self, policy: ConflictPolicy, author: &CommitAuthor) -> Result<Reconciliation> {
        let repo = self.open()?;
        let Ok(remote_oid) = repo.refname_to_id(&self.remote_ref()) else {
            return Ok(Reconciliation {
                outcome: ReconcileOutcome::RemoteEmpty,
                conflicts: ConflictReport::default(),
            });
        };

        let remote_annotated = repo.find_annotated_commit(remote_oid)?;
        let (analysis, _) = repo
            .merge_analysis(&[&remote_annotated])
            .context("failed to analyze remote head")?;

        if analysis.is_up_to_date() {
            return Ok(Reconciliation {
                outcome: ReconcileOutcome::UpToDate,
                conflicts: ConflictReport::default(),
            });
        }

        if analysis.is_unborn() || analysis.is_fast_forward() {
            self.move_branch(&repo, remote_oid, "fast-forward")?;
            return Ok(Reconciliation {
                outcome: ReconcileOutcome::FastForward {
                    head: remote_oid.to_string(),
                },
                conflicts: ConflictReport::default(),
            });
        }

        let local_oid = repo
            .refname_to_id(&self.local_ref())
            .context("local branch has no commits")?;

        let mut conflicts = ConflictReport::default();
        if let Some((head, replayed, report)) =
            self.rebase_onto(&repo, local_oid, remote_oid, policy, author)?
        {
            self.move_branch(&repo, head, "rebase")?;
            conflicts.extend(report);
            return Ok(Reconciliation {
                outcome: ReconcileOutcome::Rebased {
                    head: head.to_string(),
                    replayed,
                },
                conflicts,
            });
        }

        warn!("Rebase could not be completed, falling back to merge");
        let (head, report) = self.merge_heads(&repo, local_oid, remote_oid, policy, author)?;
        self.move_branch(&repo, head, "merge")?;
        conflicts.extend(report);
        Ok(Reconciliation {
            outcome: ReconcileOutcome::Merged {
                head: head.to_string(),
            },
            conflicts,
        })
    }

    /// Replay local commits onto the remote head. `None` means a step had
    /// conflicts the policy could not settle and the rebase was aborted.
    fn rebase_onto(
        &self,
        repo: &Repository,
        local_oid: Oid,
        remote_oid: Oid,
        policy: ConflictPolicy,
        author: &CommitAuthor,
    ) -> Result<Option<(Oid, usize, ConflictReport)>> {
        let local = repo.find_annotated_commit(local_oid)?;
        let upstream = repo.find_annotated_commit(remote_oid)?;
        let mut options = RebaseOptions::new();
        options.inmemory(true);

        let mut rebase = repo
            .rebase(Some(&local), Some(&upstream), None, Some(&mut options))
            .context("failed to start rebase")?;
        let committer = author.signature()?;

        let mut head = remote_oid;
        let mut replayed = 0;
        let mut report = ConflictReport::default();

        while let Some(operation) = rebase.next() {
            let operation = match operation {
                Ok(operation) => operation,
                Err(err) => {
                    rebase.abort()?;
                    return Err(err).context("rebase step failed");
                }
            };

            let mut index = rebase.inmemory_index()?;
            if index.has_conflicts() {
                // Replaying onto the remote: the remote is "ours"
                let step = resolve_index(repo, &mut index, policy, ConflictSide::Remote)?;
                let clean = step.is_clean();
                report.extend(step);
                if !clean {
                    debug!(commit = %operation.id(), "Rebase step has unresolved conflicts");
                    rebase.abort()?;
                    return Ok(None);
                }
            }

            match rebase.commit(None, &committer, None) {
                Ok(oid) => {
                    head = oid;
                    replayed += 1;
                }
                Err(err) if err.code() == ErrorCode::Applied => {
                    debug!(commit = %operation.id(), "Change already on remote, skipping");
                }
                Err(err) => {
                    rebase.abort()?;
                    return Err(err).context("failed to commit rebase step");
                }
            }
        }
        rebase.finish(None).context("failed to finish rebase")?;

        Ok(Some((head, replayed, report)))
    }

    /// Merge commit of the local and remote heads, with the policy's file
    /// favor for textual conflicts and the conflict handler for the rest.
    fn merge_heads(
        &self,
        repo: &Repository,
        local_oid: Oid,
        remote_oid: Oid,
        policy: ConflictPolicy,
        author: &CommitAuthor,
    ) -> Result<(Oid, ConflictReport)> {
        let local = repo.find_commit(local_oid)?;
        let remote = repo.find_commit(remote_oid)?;

        let mut options = MergeOptions::new();
        options.file_favor(match policy {
            ConflictPolicy::PreferLocal => FileFavor::Ours,
            ConflictPolicy::PreferRemote => FileFavor::Theirs,
            ConflictPolicy::NewestWins => FileFavor::Normal,
        });

        let mut index = repo
            .merge_commits(&local, &remote, Some(&options))
            .context("failed to merge remote head")?;

        let mut report = ConflictReport::default();
        if index.has_conflicts() {
            // Merging into the local branch: local is "ours"
            report = resolve_index(repo, &mut index, policy, ConflictSide::Local)?;
        }
        if index.has_conflicts() {
            return Err(SyncError::UnresolvedConflicts(report.unresolved).into());
        }

        let tree_id = index.write_tree_to(repo).context("failed to write merge tree")?;
        let tree = repo.find_tree(tree_id)?;
        let signature = author.signature()?;
        let message = format!("Merge remote-tracking branch '{ORIGIN}/{}'", self.branch);
        let oid = repo
            .commit(None, &signature, &signature, &message, &tree, &[&local, &remote])
            .context("failed to create merge commit")?;

        info!(commit = %oid, "Merged remote head");
        Ok((oid, report))
    }

    /// Push the branch. A ref update refused by the remote is
    /// [`SyncError::PushRejected`]. Returns the pushed head.
    #[instrument(skip(self, remote), fields(remote = %remote.display_url(), branch = %self.branch))]
    pub fn push(&self, remote: &RemoteSpec) -> Result<String> {
        let repo = self.open()?;
        let local_ref = self.local_ref();
        let head = repo
            .refname_to_id(&local_ref)
            .context("nothing to push, the branch has no commits")?;

        let url = remote.authenticated_url()?;
        let mut anonymous = repo
            .remote_anonymous(&url)
            .map_err(|err| transfer_error(remote, "reach", err))?;

        let rejection: RefCell<Option<(String, String)>> = RefCell::new(None);
        {
            let mut callbacks = remote.callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    *rejection.borrow_mut() = Some((refname.to_string(), message.to_string()));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);

            let refspec = format!("{local_ref}:{local_ref}");
            if let Err(err) = anonymous.push(&[refspec.as_str()], Some(&mut options)) {
                if err.code() == ErrorCode::NotFastForward {
                    return Err(SyncError::PushRejected {
                        refname: local_ref,
                        message: remote.scrub(err.message()),
                    }
                    .into());
                }
                return Err(transfer_error(remote, "push to", err));
            }
        }

        if let Some((refname, message)) = rejection.into_inner() {
            return Err(SyncError::PushRejected {
                refname,
                message: remote.scrub(&message),
            }
            .into());
        }

        // Anonymous remotes do not maintain tracking refs
        repo.reference(&self.remote_ref(), head, true, "casesync: push")
            .context("failed to update remote-tracking ref")?;

        info!(head = %head, "Pushed");
        Ok(head.to_string())
    }

    pub fn status(&self) -> Result<RepoStatus> {
        let repo = self.open()?;
        let head = head_commit(&repo)?.map(|commit| commit.id());
        let remote_head = repo.refname_to_id(&self.remote_ref()).ok();

        let (ahead, behind) = match (head, remote_head) {
            (Some(local), Some(remote)) => repo
                .graph_ahead_behind(local, remote)
                .context("failed to compare with remote head")?,
            (Some(local), None) => (count_commits(&repo, local)?, 0),
            (None, Some(remote)) => (0, count_commits(&repo, remote)?),
            (None, None) => (0, 0),
        };

        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let dirty = repo
            .statuses(Some(&mut options))
            .context("failed to read working tree status")?
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT)
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();

        let remote_url = repo
            .find_remote(ORIGIN)
            .ok()
            .and_then(|remote| remote.url().map(redact_url));

        Ok(RepoStatus {
            branch: self.branch.clone(),
            head: head.map(|oid| oid.to_string()),
            remote_head: remote_head.map(|oid| oid.to_string()),
            ahead,
            behind,
            dirty,
            remote_url,
        })
    }

    /// Switch HEAD to the configured branch, creating it at the current
    /// commit when it does not exist yet.
    fn ensure_on_branch(&self, repo: &Repository) -> Result<()> {
        let local_ref = self.local_ref();
        let on_branch = repo
            .find_reference("HEAD")
            .context("failed to read HEAD")?
            .symbolic_target()
            == Some(local_ref.as_str());
        if on_branch {
            return Ok(());
        }

        if repo.find_reference(&local_ref).is_err() {
            if let Some(current) = head_commit(repo)? {
                repo.branch(&self.branch, &current, false)
                    .with_context(|| format!("failed to create branch {}", self.branch))?;
            }
        }
        repo.set_head(&local_ref)
            .with_context(|| format!("failed to switch to {}", self.branch))?;
        if head_commit(repo)?.is_some() {
            repo.checkout_head(Some(CheckoutBuilder::new().force()))
                .context("failed to check out branch")?;
        }

        info!(branch = %self.branch, "Switched sync branch");
        Ok(())
    }

    /// Point the local branch at `target` and make the working tree match.
    fn move_branch(&self, repo: &Repository, target: Oid, reason: &str) -> Result<()> {
        repo.reference(&self.local_ref(), target, true, &format!("casesync: {reason}"))
            .context("failed to update branch")?;
        repo.set_head(&self.local_ref()).context("failed to update HEAD")?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
            .context("failed to check out working tree")?;
        Ok(())
    }
}

fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit().context("HEAD is not a commit")?)),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
        Err(err) => Err(err).context("failed to resolve HEAD"),
    }
}

fn count_commits(repo: &Repository, from: Oid) -> Result<usize> {
    let mut revwalk = repo.revwalk()?;
    revwalk.push(from)?;
    Ok(revwalk.count())
}

fn transfer_error(remote: &RemoteSpec, action: &str, err: git2::Error) -> anyhow::Error {
    anyhow!(
        "failed to {action} {}: {}",
        remote.display_url(),
        remote.scrub(err.message())
    )
}
