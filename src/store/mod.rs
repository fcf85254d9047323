//! Relational access for the sync engine.
//!
//! The exporter and importer only talk to [`ProjectStore`]. `PgProjectStore`
//! backs it with PostgreSQL; `MemoryProjectStore` is used by tests and dry runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Attachment, EntityKind, GitSettings, Project, Section, TestCase, TestPlan, TestRun,
};

mod memory;
mod postgres;

pub use memory::MemoryProjectStore;
pub use postgres::PgProjectStore;

/// Upsert contract shared by every entity kind: when a row with the record's id
/// exists in the same project it is updated (and un-deleted) in place and that
/// id is returned. Otherwise a new row is inserted, keeping the record's id if
/// no row of that kind holds it and assigning a fresh one if it does; the id
/// actually used is returned. A non-positive id always inserts a new row with a
/// fresh id. Foreign keys on the record must already be local ids.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, project_id: i64) -> Result<Option<Project>>;

    async fn list_sections(&self, project_id: i64) -> Result<Vec<Section>>;
    async fn list_test_cases(&self, project_id: i64) -> Result<Vec<TestCase>>;
    async fn list_test_plans(&self, project_id: i64) -> Result<Vec<TestPlan>>;
    async fn list_test_runs(&self, project_id: i64) -> Result<Vec<TestRun>>;
    async fn list_attachments(&self, project_id: i64) -> Result<Vec<Attachment>>;

    async fn upsert_section(&self, project_id: i64, section: &Section) -> Result<i64>;
    async fn upsert_test_case(&self, project_id: i64, case: &TestCase) -> Result<i64>;
    async fn upsert_test_plan(&self, project_id: i64, plan: &TestPlan) -> Result<i64>;
    async fn upsert_test_run(&self, project_id: i64, run: &TestRun) -> Result<i64>;
    async fn upsert_attachment(&self, project_id: i64, attachment: &Attachment) -> Result<i64>;

    /// Soft-delete every live row of `kind` whose id is not in `keep`.
    /// Attachments have no soft delete; use [`ProjectStore::delete_missing_attachments`].
    async fn soft_delete_missing(
        &self,
        project_id: i64,
        kind: EntityKind,
        keep: &[i64],
    ) -> Result<u64>;

    /// Physically delete attachment rows not in `keep`, returning them so the
    /// caller can remove their stored binaries.
    async fn delete_missing_attachments(
        &self,
        project_id: i64,
        keep: &[i64],
    ) -> Result<Vec<Attachment>>;

    async fn get_git_settings(&self, project_id: i64) -> Result<Option<GitSettings>>;
    async fn save_git_settings(&self, settings: &GitSettings) -> Result<()>;
    async fn record_sync(
        &self,
        project_id: i64,
        commit: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;
}
