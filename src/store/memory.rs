use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::ProjectStore;
use crate::model::{
    Attachment, EntityKind, GitSettings, Project, Section, TestCase, TestPlan, TestRun,
};

trait Record: Clone {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn project_id(&self) -> i64;
    fn set_project_id(&mut self, project_id: i64);
}

macro_rules! impl_record {
    ($($ty:ty),*) => {
        $(
            impl Record for $ty {
                fn id(&self) -> i64 {
                    self.id
                }
                fn set_id(&mut self, id: i64) {
                    self.id = id;
                }
                fn project_id(&self) -> i64 {
                    self.project_id
                }
                fn set_project_id(&mut self, project_id: i64) {
                    self.project_id = project_id;
                }
            }
        )*
    };
}

impl_record!(Section, TestCase, TestPlan, TestRun, Attachment);

#[derive(Debug, Clone)]
struct Row<T> {
    record: T,
    deleted: bool,
}

#[derive(Debug)]
struct Table<T> {
    rows: BTreeMap<i64, Row<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<T: Record> Table<T> {
    fn live(&self, project_id: i64) -> Vec<T> {
        self.rows
            .values()
            .filter(|row| !row.deleted && row.record.project_id() == project_id)
            .map(|row| row.record.clone())
            .collect()
    }

    fn upsert(&mut self, project_id: i64, record: &T, next_id: &mut i64) -> i64 {
        let mut record = record.clone();
        record.set_project_id(project_id);

        let id_taken = match self.rows.get(&record.id()) {
            Some(row) => row.record.project_id() != project_id,
            None => record.id() <= 0,
        };

        if id_taken {
            record.set_id(*next_id);
            *next_id += 1;
        } else if record.id() >= *next_id {
            *next_id = record.id() + 1;
        }

        let id = record.id();
        self.rows.insert(
            id,
            Row {
                record,
                deleted: false,
            },
        );
        id
    }

    fn put(&mut self, record: T) {
        self.rows.insert(
            record.id(),
            Row {
                record,
                deleted: false,
            },
        );
    }

    fn soft_delete_missing(&mut self, project_id: i64, keep: &HashSet<i64>) -> u64 {
        let mut count = 0;
        for row in self.rows.values_mut() {
            if !row.deleted
                && row.record.project_id() == project_id
                && !keep.contains(&row.record.id())
            {
                row.deleted = true;
                count += 1;
            }
        }
        count
    }

    fn is_deleted(&self, id: i64) -> Option<bool> {
        self.rows.get(&id).map(|row| row.deleted)
    }
}

#[derive(Debug)]
struct MemoryState {
    next_id: i64,
    projects: BTreeMap<i64, Project>,
    sections: Table<Section>,
    test_cases: Table<TestCase>,
    test_plans: Table<TestPlan>,
    test_runs: Table<TestRun>,
    attachments: Table<Attachment>,
    git_settings: HashMap<i64, GitSettings>,
}

impl MemoryState {
    fn bump_next_id(&mut self, id: i64) {
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }
}

/// In-process [`ProjectStore`] with the same id-assignment contract as PostgreSQL
/// (one monotonically increasing sequence).
#[derive(Clone)]
pub struct MemoryProjectStore {
    state: Arc<RwLock<MemoryState>>,
}

impl Default for MemoryProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    /// Start the id sequence at `first_id`, handy for simulating a second database.
    pub fn with_first_id(first_id: i64) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                next_id: first_id,
                projects: BTreeMap::new(),
                sections: Table::default(),
                test_cases: Table::default(),
                test_plans: Table::default(),
                test_runs: Table::default(),
                attachments: Table::default(),
                git_settings: HashMap::new(),
            })),
        }
    }

    pub async fn put_project(&self, project: Project) {
        let mut state = self.state.write().await;
        state.bump_next_id(project.id);
        state.projects.insert(project.id, project);
    }

    pub async fn put_section(&self, section: Section) {
        let mut state = self.state.write().await;
        state.bump_next_id(section.id);
        state.sections.put(section);
    }

    pub async fn put_test_case(&self, case: TestCase) {
        let mut state = self.state.write().await;
        state.bump_next_id(case.id);
        state.test_cases.put(case);
    }

    pub async fn put_test_plan(&self, plan: TestPlan) {
        let mut state = self.state.write().await;
        state.bump_next_id(plan.id);
        state.test_plans.put(plan);
    }

    pub async fn put_test_run(&self, run: TestRun) {
        let mut state = self.state.write().await;
        state.bump_next_id(run.id);
        state.test_runs.put(run);
    }

    pub async fn put_attachment(&self, attachment: Attachment) {
        let mut state = self.state.write().await;
        state.bump_next_id(attachment.id);
        state.attachments.put(attachment);
    }

    /// `Some(true)` when the row exists but is soft-deleted.
    pub async fn is_deleted(&self, kind: EntityKind, id: i64) -> Option<bool> {
        let state = self.state.read().await;
        match kind {
            EntityKind::Section => state.sections.is_deleted(id),
            EntityKind::TestCase => state.test_cases.is_deleted(id),
            EntityKind::TestPlan => state.test_plans.is_deleted(id),
            EntityKind::TestRun => state.test_runs.is_deleted(id),
            EntityKind::Attachment => state.attachments.is_deleted(id),
        }
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        Ok(self.state.read().await.projects.get(&project_id).cloned())
    }

    async fn list_sections(&self, project_id: i64) -> Result<Vec<Section>> {
        Ok(self.state.read().await.sections.live(project_id))
    }

    async fn list_test_cases(&self, project_id: i64) -> Result<Vec<TestCase>> {
        Ok(self.state.read().await.test_cases.live(project_id))
    }

    async fn list_test_plans(&self, project_id: i64) -> Result<Vec<TestPlan>> {
        Ok(self.state.read().await.test_plans.live(project_id))
    }

    async fn list_test_runs(&self, project_id: i64) -> Result<Vec<TestRun>> {
        Ok(self.state.read().await.test_runs.live(project_id))
    }

    async fn list_attachments(&self, project_id: i64) -> Result<Vec<Attachment>> {
        Ok(self.state.read().await.attachments.live(project_id))
    }

    async fn upsert_section(&self, project_id: i64, section: &Section) -> Result<i64> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(parent_id) = section.parent_id {
            if state.sections.is_deleted(parent_id).is_none() {
                bail!("parent section {parent_id} does not exist");
            }
        }
        Ok(state
            .sections
            .upsert(project_id, section, &mut state.next_id))
    }

    async fn upsert_test_case(&self, project_id: i64, case: &TestCase) -> Result<i64> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(section_id) = case.section_id {
            if state.sections.is_deleted(section_id).is_none() {
                bail!("section {section_id} does not exist");
            }
        }
        Ok(state
            .test_cases
            .upsert(project_id, case, &mut state.next_id))
    }

    async fn upsert_test_plan(&self, project_id: i64, plan: &TestPlan) -> Result<i64> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        Ok(state
            .test_plans
            .upsert(project_id, plan, &mut state.next_id))
    }

    async fn upsert_test_run(&self, project_id: i64, run: &TestRun) -> Result<i64> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(plan_id) = run.plan_id {
            if state.test_plans.is_deleted(plan_id).is_none() {
                bail!("test plan {plan_id} does not exist");
            }
        }
        Ok(state.test_runs.upsert(project_id, run, &mut state.next_id))
    }

    async fn upsert_attachment(&self, project_id: i64, attachment: &Attachment) -> Result<i64> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        Ok(state
            .attachments
            .upsert(project_id, attachment, &mut state.next_id))
    }

    async fn soft_delete_missing(
        &self,
        project_id: i64,
        kind: EntityKind,
        keep: &[i64],
    ) -> Result<u64> {
        let keep: HashSet<i64> = keep.iter().copied().collect();
        let mut state = self.state.write().await;
        let count = match kind {
            EntityKind::Section => state.sections.soft_delete_missing(project_id, &keep),
            EntityKind::TestCase => state.test_cases.soft_delete_missing(project_id, &keep),
            EntityKind::TestPlan => state.test_plans.soft_delete_missing(project_id, &keep),
            EntityKind::TestRun => state.test_runs.soft_delete_missing(project_id, &keep),
            EntityKind::Attachment => bail!("{kind} rows cannot be soft-deleted"),
        };
        Ok(count)
    }

    async fn delete_missing_attachments(
        &self,
        project_id: i64,
        keep: &[i64],
    ) -> Result<Vec<Attachment>> {
        let keep: HashSet<i64> = keep.iter().copied().collect();
        let mut state = self.state.write().await;
        let doomed: Vec<i64> = state
            .attachments
            .rows
            .values()
            .filter(|row| row.record.project_id == project_id && !keep.contains(&row.record.id))
            .map(|row| row.record.id)
            .collect();

        Ok(doomed
            .into_iter()
            .filter_map(|id| state.attachments.rows.remove(&id))
            .map(|row| row.record)
            .collect())
    }

    async fn get_git_settings(&self, project_id: i64) -> Result<Option<GitSettings>> {
        Ok(self.state.read().await.git_settings.get(&project_id).cloned())
    }

    async fn save_git_settings(&self, settings: &GitSettings) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .git_settings
            .entry(settings.project_id)
            .or_insert_with(|| settings.clone());
        let last_sync_at = entry.last_sync_at;
        let last_commit = entry.last_commit.clone();
        *entry = GitSettings {
            last_sync_at,
            last_commit,
            ..settings.clone()
        };
        Ok(())
    }

    async fn record_sync(
        &self,
        project_id: i64,
        commit: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(settings) = state.git_settings.get_mut(&project_id) {
            settings.last_sync_at = Some(at);
            if let Some(commit) = commit {
                settings.last_commit = Some(commit.to_string());
            }
        }
        Ok(())
    }
}
