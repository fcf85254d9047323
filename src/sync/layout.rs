//! On-disk layout of a project's sync tree.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::model::{EntityKind, Project};
use crate::types::SanitizedFileName;

pub const FORMAT_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ATTACHMENT_FILES_DIR: &str = "files";

/// Top-level description of an exported project. Deliberately carries no
/// timestamp of the export itself so unchanged data yields an unchanged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub project: Project,
    pub counts: BTreeMap<EntityKind, usize>,
}

/// What a repository-relative path in the sync tree refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreePath {
    Manifest,
    Entity(EntityKind, i64),
    AttachmentBlob(i64),
    Other,
}

impl TreePath {
    /// Classify a `/`-separated path relative to the tree root.
    pub fn classify(relative: &str) -> Self {
        if relative == MANIFEST_FILE {
            return TreePath::Manifest;
        }

        let parts: Vec<&str> = relative.split('/').collect();
        match parts.as_slice() {
            ["attachments", files, name] if *files == ATTACHMENT_FILES_DIR => {
                match parse_blob_file_name(name) {
                    Some(id) => TreePath::AttachmentBlob(id),
                    None => TreePath::Other,
                }
            }
            [dir, name] => {
                let kind = EntityKind::ALL.into_iter().find(|k| k.dir_name() == *dir);
                match (kind, parse_entity_file_name(name)) {
                    (Some(kind), Some(id)) => TreePath::Entity(kind, id),
                    _ => TreePath::Other,
                }
            }
            _ => TreePath::Other,
        }
    }
}

/// `<id>.json` -> id
pub fn parse_entity_file_name(name: &str) -> Option<i64> {
    name.strip_suffix(".json")?.parse().ok()
}

/// `<id>-<name>` -> id
pub fn parse_blob_file_name(name: &str) -> Option<i64> {
    let (id, rest) = name.split_once('-')?;
    if rest.is_empty() {
        return None;
    }
    id.parse().ok()
}

#[derive(Debug, Clone)]
pub struct SyncTree {
    root: PathBuf,
}

impl SyncTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<work_dir>/project-<id>`
    pub fn for_project(work_dir: &Path, project_id: i64) -> Self {
        Self::new(work_dir.join(format!("project-{project_id}")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn entity_dir(&self, kind: EntityKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn entity_path(&self, kind: EntityKind, id: i64) -> PathBuf {
        self.entity_dir(kind).join(format!("{id}.json"))
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.entity_dir(EntityKind::Attachment)
            .join(ATTACHMENT_FILES_DIR)
    }

    pub fn blob_file_name(id: i64, original_name: &str) -> String {
        format!("{id}-{}", SanitizedFileName::new(original_name))
    }

    pub fn blob_path(&self, id: i64, original_name: &str) -> PathBuf {
        self.blob_dir().join(Self::blob_file_name(id, original_name))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            let dir = self.entity_dir(kind);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let blobs = self.blob_dir();
        std::fs::create_dir_all(&blobs)
            .with_context(|| format!("failed to create {}", blobs.display()))?;
        Ok(())
    }

    /// Entity files present for `kind`, keyed by id. Unrecognized names are ignored.
    pub fn list_entity_files(&self, kind: EntityKind) -> Result<BTreeMap<i64, PathBuf>> {
        let mut files = BTreeMap::new();
        let dir = self.entity_dir(kind);
        if !dir.exists() {
            return Ok(files);
        }

        for entry in
            std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(parse_entity_file_name) {
                files.insert(id, entry.path());
            }
        }
        Ok(files)
    }

    /// Attachment binaries present, keyed by file name.
    pub fn list_blob_files(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut files = BTreeMap::new();
        let dir = self.blob_dir();
        if !dir.exists() {
            return Ok(files);
        }

        for entry in
            std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.insert(name.to_string(), entry.path());
            }
        }
        Ok(files)
    }
}

/// Serialize `value` as pretty JSON with a trailing newline. The file is only
/// rewritten when its bytes change; returns whether it was written.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    bytes.push(b'\n');

    if let Ok(existing) = std::fs::read(path) {
        if existing == bytes {
            return Ok(false);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}
