//! Picking a side for conflicted paths.
//!
//! The decision is made in local/remote terms. Whoever drives the
//! integration says which index stage holds which side: a rebase replays
//! local commits onto the remote, so "ours" is the remote there, while a
//! merge into the local branch keeps "ours" local.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::sync::layout::TreePath;

/// Stage bits of `git_index_entry.flags`.
const INDEX_STAGE_MASK: u16 = 0x3000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    PreferRemote,
    PreferLocal,
    /// Exported rows compare `updated_at`; everything else the tree owns
    /// follows the remote
    #[default]
    NewestWins,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::PreferRemote => "prefer_remote",
            ConflictPolicy::PreferLocal => "prefer_local",
            ConflictPolicy::NewestWins => "newest_wins",
        })
    }
}

impl FromStr for ConflictPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "prefer_remote" | "remote" | "theirs" => Ok(ConflictPolicy::PreferRemote),
            "prefer_local" | "local" | "ours" => Ok(ConflictPolicy::PreferLocal),
            "newest_wins" | "newest" => Ok(ConflictPolicy::NewestWins),
            other => Err(anyhow!(
                "unknown conflict policy '{other}' (expected prefer_remote, prefer_local or newest_wins)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub path: String,
    pub side: ConflictSide,
    /// The chosen side had deleted the path
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub resolved: Vec<ResolvedConflict>,
    pub unresolved: Vec<String>,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn extend(&mut self, other: ConflictReport) {
        self.resolved.extend(other.resolved);
        self.unresolved.extend(other.unresolved);
    }
}

/// Choose the side to keep for one conflicted path, or `None` when the path
/// is not something the sync tree owns and the policy does not settle it.
/// `None` content means that side deleted the path.
pub fn choose_side(
    policy: ConflictPolicy,
    path: &str,
    local: Option<&[u8]>,
    remote: Option<&[u8]>,
) -> Option<ConflictSide> {
    // Modify/delete: the edit survives
    match (local, remote) {
        (Some(_), None) => return Some(ConflictSide::Local),
        (None, Some(_)) | (None, None) => return Some(ConflictSide::Remote),
        (Some(_), Some(_)) => {}
    }

    match TreePath::classify(path) {
        // Regenerated by the next export
        TreePath::Manifest | TreePath::AttachmentBlob(_) => Some(ConflictSide::Remote),
        TreePath::Entity(..) => match policy {
            ConflictPolicy::PreferRemote => Some(ConflictSide::Remote),
            ConflictPolicy::PreferLocal => Some(ConflictSide::Local),
            ConflictPolicy::NewestWins => {
                let local_ts = local.and_then(row_timestamp);
                let remote_ts = remote.and_then(row_timestamp);
                match (local_ts, remote_ts) {
                    (Some(l), Some(r)) if l > r => Some(ConflictSide::Local),
                    (Some(_), None) => Some(ConflictSide::Local),
                    _ => Some(ConflictSide::Remote),
                }
            }
        },
        TreePath::Other => match policy {
            ConflictPolicy::PreferRemote => Some(ConflictSide::Remote),
            ConflictPolicy::PreferLocal => Some(ConflictSide::Local),
            ConflictPolicy::NewestWins => None,
        },
    }
}

/// `updated_at` of an exported row, falling back to `created_at` for rows
/// that are never edited in place.
fn row_timestamp(content: &[u8]) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_slice(content).ok()?;
    let raw = value
        .get("updated_at")
        .or_else(|| value.get("created_at"))?
        .as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Resolve every conflict in `index`. `ours` says which side the index's
/// "ours" stage holds. Paths the policy cannot settle stay conflicted and are
/// listed in the report.
pub fn resolve_index(
    repo: &git2::Repository,
    index: &mut git2::Index,
    policy: ConflictPolicy,
    ours: ConflictSide,
) -> Result<ConflictReport> {
    let conflicts = index
        .conflicts()
        .context("failed to read index conflicts")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to read index conflicts")?;

    let mut report = ConflictReport::default();
    for conflict in conflicts {
        let Some(path) = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
        else {
            continue;
        };

        let (local_entry, remote_entry) = match ours {
            ConflictSide::Local => (conflict.our, conflict.their),
            ConflictSide::Remote => (conflict.their, conflict.our),
        };

        let local = local_entry
            .as_ref()
            .map(|entry| blob_content(repo, entry))
            .transpose()?;
        let remote = remote_entry
            .as_ref()
            .map(|entry| blob_content(repo, entry))
            .transpose()?;

        let Some(side) = choose_side(policy, &path, local.as_deref(), remote.as_deref()) else {
            warn!(path = %path, %policy, "Conflict left unresolved");
            report.unresolved.push(path);
            continue;
        };

        let chosen = match side {
            ConflictSide::Local => local_entry,
            ConflictSide::Remote => remote_entry,
        };

        index
            .conflict_remove(Path::new(&path))
            .with_context(|| format!("failed to clear conflict on {path}"))?;
        let deleted = chosen.is_none();
        if let Some(mut entry) = chosen {
            entry.flags &= !INDEX_STAGE_MASK;
            index
                .add(&entry)
                .with_context(|| format!("failed to stage resolution of {path}"))?;
        }

        debug!(path = %path, ?side, deleted, "Resolved conflict");
        report.resolved.push(ResolvedConflict {
            path,
            side,
            deleted,
        });
    }

    Ok(report)
}

fn blob_content(repo: &git2::Repository, entry: &git2::IndexEntry) -> Result<Vec<u8>> {
    let blob = repo
        .find_blob(entry.id)
        .with_context(|| format!("missing blob {}", entry.id))?;
    Ok(blob.content().to_vec())
}
