use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use std::time::Duration;
use tracing::instrument;

use super::ProjectStore;
use crate::model::{
    Attachment, EntityKind, GitSettings, Project, Section, TestCase, TestPlan, TestRun,
};

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

#[derive(Clone)]
pub struct PgProjectStore {
    pool: PgPool,
}

impl PgProjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Create the tables casesync reads and writes if they do not exist.
    #[instrument(skip(self))]
    pub async fn bootstrap_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("failed to bootstrap schema")?;
        Ok(())
    }

    /// Id for a new row of `kind`: the incoming id when no row of that kind
    /// holds it yet, otherwise the next value of the table's sequence.
    async fn insert_id(&self, kind: EntityKind, wanted: i64) -> Result<i64> {
        // Table names come from a closed enum, never from input.
        let sql = format!(
            r#"
            SELECT CASE
                WHEN $1 > 0 AND NOT EXISTS (SELECT 1 FROM {table} WHERE id = $1) THEN $1
                ELSE nextval(pg_get_serial_sequence('{table}', 'id'))
            END
            "#,
            table = kind.table()
        );

        sqlx::query_scalar::<_, i64>(&sql)
            .bind(wanted)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to allocate {kind} id"))
    }

    /// Move the table's sequence past explicitly inserted ids.
    async fn sync_sequence(&self, kind: EntityKind) -> Result<()> {
        let sql = format!(
            r#"
            SELECT setval(
                pg_get_serial_sequence('{table}', 'id'),
                GREATEST((SELECT MAX(id) FROM {table}), 1)
            )
            "#,
            table = kind.table()
        );

        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to advance {kind} id sequence"))?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    #[instrument(skip(self))]
    async fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, name, description, created_at, updated_at
            FROM projects
            WHERE id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch project")?;

        Ok(row)
    }

    #[instrument(skip(self))]
    async fn list_sections(&self, project_id: i64) -> Result<Vec<Section>> {
        let rows = sqlx::query_as::<_, Section>(
            r#"
            SELECT id, project_id, parent_id, name, description, position, created_at, updated_at
            FROM sections
            WHERE project_id = $1 AND is_deleted = FALSE
            ORDER BY id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list sections")?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn list_test_cases(&self, project_id: i64) -> Result<Vec<TestCase>> {
        let rows = sqlx::query_as::<_, TestCase>(
            r#"
            SELECT
                id,
                project_id,
                section_id,
                title,
                preconditions,
                steps,
                expected_result,
                priority,
                case_type,
                status,
                tags,
                position,
                created_at,
                updated_at
            FROM test_cases
            WHERE project_id = $1 AND is_deleted = FALSE
            ORDER BY id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list test cases")?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn list_test_plans(&self, project_id: i64) -> Result<Vec<TestPlan>> {
        let rows = sqlx::query_as::<_, TestPlan>(
            r#"
            SELECT id, project_id, name, description, status, test_case_ids, created_at, updated_at
            FROM test_plans
            WHERE project_id = $1 AND is_deleted = FALSE
            ORDER BY id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list test plans")?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn list_test_runs(&self, project_id: i64) -> Result<Vec<TestRun>> {
        let rows = sqlx::query_as::<_, TestRun>(
            r#"
            SELECT
                id,
                project_id,
                plan_id,
                name,
                status,
                started_at,
                completed_at,
                results,
                created_at,
                updated_at
            FROM test_runs
            WHERE project_id = $1 AND is_deleted = FALSE
            ORDER BY id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list test runs")?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn list_attachments(&self, project_id: i64) -> Result<Vec<Attachment>> {
        let rows = sqlx::query_as::<_, Attachment>(
            r#"
            SELECT
                id,
                project_id,
                test_case_id,
                original_name,
                stored_name,
                mime_type,
                size_bytes,
                created_at
            FROM attachments
            WHERE project_id = $1
            ORDER BY id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list attachments")?;

        Ok(rows)
    }

    #[instrument(skip(self, section), fields(section_id = section.id))]
    async fn upsert_section(&self, project_id: i64, section: &Section) -> Result<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE sections
            SET parent_id = $3,
                name = $4,
                description = $5,
                position = $6,
                updated_at = $7,
                is_deleted = FALSE
            WHERE id = $1 AND project_id = $2
            RETURNING id
            "#,
        )
        .bind(section.id)
        .bind(project_id)
        .bind(section.parent_id)
        .bind(&section.name)
        .bind(&section.description)
        .bind(section.position)
        .bind(section.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to update section")?;

        if let Some(id) = updated {
            return Ok(id);
        }

        let id = self.insert_id(EntityKind::Section, section.id).await?;
        sqlx::query(
            r#"
            INSERT INTO sections (
                id,
                project_id,
                parent_id,
                name,
                description,
                position,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(section.parent_id)
        .bind(&section.name)
        .bind(&section.description)
        .bind(section.position)
        .bind(section.created_at)
        .bind(section.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert section")?;

        self.sync_sequence(EntityKind::Section).await?;
        Ok(id)
    }

    #[instrument(skip(self, case), fields(case_id = case.id))]
    async fn upsert_test_case(&self, project_id: i64, case: &TestCase) -> Result<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE test_cases
            SET section_id = $3,
                title = $4,
                preconditions = $5,
                steps = $6,
                expected_result = $7,
                priority = $8,
                case_type = $9,
                status = $10,
                tags = $11,
                position = $12,
                updated_at = $13,
                is_deleted = FALSE
            WHERE id = $1 AND project_id = $2
            RETURNING id
            "#,
        )
        .bind(case.id)
        .bind(project_id)
        .bind(case.section_id)
        .bind(&case.title)
        .bind(&case.preconditions)
        .bind(Json(case.steps.clone()))
        .bind(&case.expected_result)
        .bind(&case.priority)
        .bind(&case.case_type)
        .bind(&case.status)
        .bind(case.tags.clone())
        .bind(case.position)
        .bind(case.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to update test case")?;

        if let Some(id) = updated {
            return Ok(id);
        }

        let id = self.insert_id(EntityKind::TestCase, case.id).await?;
        sqlx::query(
            r#"
            INSERT INTO test_cases (
                id,
                project_id,
                section_id,
                title,
                preconditions,
                steps,
                expected_result,
                priority,
                case_type,
                status,
                tags,
                position,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(case.section_id)
        .bind(&case.title)
        .bind(&case.preconditions)
        .bind(Json(case.steps.clone()))
        .bind(&case.expected_result)
        .bind(&case.priority)
        .bind(&case.case_type)
        .bind(&case.status)
        .bind(case.tags.clone())
        .bind(case.position)
        .bind(case.created_at)
        .bind(case.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert test case")?;

        self.sync_sequence(EntityKind::TestCase).await?;
        Ok(id)
    }

    #[instrument(skip(self, plan), fields(plan_id = plan.id))]
    async fn upsert_test_plan(&self, project_id: i64, plan: &TestPlan) -> Result<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE test_plans
            SET name = $3,
                description = $4,
                status = $5,
                test_case_ids = $6,
                updated_at = $7,
                is_deleted = FALSE
            WHERE id = $1 AND project_id = $2
            RETURNING id
            "#,
        )
        .bind(plan.id)
        .bind(project_id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(&plan.status)
        .bind(plan.test_case_ids.clone())
        .bind(plan.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to update test plan")?;

        if let Some(id) = updated {
            return Ok(id);
        }

        let id = self.insert_id(EntityKind::TestPlan, plan.id).await?;
        sqlx::query(
            r#"
            INSERT INTO test_plans (
                id,
                project_id,
                name,
                description,
                status,
                test_case_ids,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(&plan.status)
        .bind(plan.test_case_ids.clone())
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert test plan")?;

        self.sync_sequence(EntityKind::TestPlan).await?;
        Ok(id)
    }

    #[instrument(skip(self, run), fields(run_id = run.id))]
    async fn upsert_test_run(&self, project_id: i64, run: &TestRun) -> Result<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE test_runs
            SET plan_id = $3,
                name = $4,
                status = $5,
                started_at = $6,
                completed_at = $7,
                results = $8,
                updated_at = $9,
                is_deleted = FALSE
            WHERE id = $1 AND project_id = $2
            RETURNING id
            "#,
        )
        .bind(run.id)
        .bind(project_id)
        .bind(run.plan_id)
        .bind(&run.name)
        .bind(&run.status)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(Json(run.results.clone()))
        .bind(run.updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to update test run")?;

        if let Some(id) = updated {
            return Ok(id);
        }

        let id = self.insert_id(EntityKind::TestRun, run.id).await?;
        sqlx::query(
            r#"
            INSERT INTO test_runs (
                id,
                project_id,
                plan_id,
                name,
                status,
                started_at,
                completed_at,
                results,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(run.plan_id)
        .bind(&run.name)
        .bind(&run.status)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(Json(run.results.clone()))
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert test run")?;

        self.sync_sequence(EntityKind::TestRun).await?;
        Ok(id)
    }

    #[instrument(skip(self, attachment), fields(attachment_id = attachment.id))]
    async fn upsert_attachment(&self, project_id: i64, attachment: &Attachment) -> Result<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE attachments
            SET test_case_id = $3,
                original_name = $4,
                stored_name = $5,
                mime_type = $6,
                size_bytes = $7
            WHERE id = $1 AND project_id = $2
            RETURNING id
            "#,
        )
        .bind(attachment.id)
        .bind(project_id)
        .bind(attachment.test_case_id)
        .bind(&attachment.original_name)
        .bind(&attachment.stored_name)
        .bind(&attachment.mime_type)
        .bind(attachment.size_bytes)
        .fetch_optional(&self.pool)
        .await
        .context("failed to update attachment")?;

        if let Some(id) = updated {
            return Ok(id);
        }

        let id = self.insert_id(EntityKind::Attachment, attachment.id).await?;
        sqlx::query(
            r#"
            INSERT INTO attachments (
                id,
                project_id,
                test_case_id,
                original_name,
                stored_name,
                mime_type,
                size_bytes,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(attachment.test_case_id)
        .bind(&attachment.original_name)
        .bind(&attachment.stored_name)
        .bind(&attachment.mime_type)
        .bind(attachment.size_bytes)
        .bind(attachment.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert attachment")?;

        self.sync_sequence(EntityKind::Attachment).await?;
        Ok(id)
    }

    #[instrument(skip(self, keep), fields(keep = keep.len()))]
    async fn soft_delete_missing(
        &self,
        project_id: i64,
        kind: EntityKind,
        keep: &[i64],
    ) -> Result<u64> {
        anyhow::ensure!(
            kind.supports_soft_delete(),
            "{kind} rows cannot be soft-deleted"
        );

        let sql = format!(
            r#"
            UPDATE {}
            SET is_deleted = TRUE,
                updated_at = NOW()
            WHERE project_id = $1
              AND is_deleted = FALSE
              AND NOT (id = ANY($2))
            "#,
            kind.table()
        );

        let result = sqlx::query(&sql)
            .bind(project_id)
            .bind(keep.to_vec())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to soft-delete missing {kind}"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, keep), fields(keep = keep.len()))]
    async fn delete_missing_attachments(
        &self,
        project_id: i64,
        keep: &[i64],
    ) -> Result<Vec<Attachment>> {
        let rows = sqlx::query_as::<_, Attachment>(
            r#"
            DELETE FROM attachments
            WHERE project_id = $1
              AND NOT (id = ANY($2))
            RETURNING
                id,
                project_id,
                test_case_id,
                original_name,
                stored_name,
                mime_type,
                size_bytes,
                created_at
            "#,
        )
        .bind(project_id)
        .bind(keep.to_vec())
        .fetch_all(&self.pool)
        .await
        .context("failed to delete missing attachments")?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn get_git_settings(&self, project_id: i64) -> Result<Option<GitSettings>> {
        let row = sqlx::query_as::<_, GitSettings>(
            r#"
            SELECT
                project_id,
                remote_url,
                branch,
                access_token,
                author_name,
                author_email,
                last_sync_at,
                last_commit
            FROM project_git_settings
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch git settings")?;

        Ok(row)
    }

    #[instrument(skip(self, settings), fields(project_id = settings.project_id))]
    async fn save_git_settings(&self, settings: &GitSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_git_settings (
                project_id,
                remote_url,
                branch,
                access_token,
                author_name,
                author_email
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (project_id)
            DO UPDATE
                SET remote_url = EXCLUDED.remote_url,
                    branch = EXCLUDED.branch,
                    access_token = EXCLUDED.access_token,
                    author_name = EXCLUDED.author_name,
                    author_email = EXCLUDED.author_email,
                    updated_at = NOW()
            "#,
        )
        .bind(settings.project_id)
        .bind(&settings.remote_url)
        .bind(&settings.branch)
        .bind(&settings.access_token)
        .bind(&settings.author_name)
        .bind(&settings.author_email)
        .execute(&self.pool)
        .await
        .context("failed to save git settings")?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_sync(
        &self,
        project_id: i64,
        commit: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE project_git_settings
            SET last_sync_at = $2,
                last_commit = COALESCE($3, last_commit),
                updated_at = NOW()
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .bind(at)
        .bind(commit)
        .execute(&self.pool)
        .await
        .context("failed to record sync")?;

        Ok(())
    }
}
