//! Shared fixtures for the sync integration tests: project records, a seeded
//! in-memory database and a bare git remote in a temp dir.

#![allow(dead_code)]

use anyhow::Result;
use casesync::{
    Attachment, ConflictPolicy, MemoryProjectStore, Project, RunResult, Section, SyncConfig,
    SyncService, TestCase, TestPlan, TestRun, TestStep,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub fn ts(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn project() -> Project {
    Project {
        id: 1,
        name: "Checkout".to_string(),
        description: None,
        created_at: ts(0),
        updated_at: ts(0),
    }
}

pub fn test_case(id: i64, section_id: Option<i64>, title: &str, updated: i64) -> TestCase {
    TestCase {
        id,
        project_id: 1,
        section_id,
        title: title.to_string(),
        preconditions: Some("Cart holds one item".to_string()),
        steps: vec![
            TestStep {
                action: "Open checkout".to_string(),
                expected: Some("Order summary shown".to_string()),
            },
            TestStep {
                action: "Submit payment".to_string(),
                expected: Some("Confirmation page".to_string()),
            },
        ],
        expected_result: Some("Order placed".to_string()),
        priority: "high".to_string(),
        case_type: "functional".to_string(),
        status: "active".to_string(),
        tags: vec!["checkout".to_string()],
        position: 0,
        created_at: ts(0),
        updated_at: ts(updated),
    }
}

/// Two sections, two cases, a plan, a run and an attachment with its binary.
pub async fn seed(store: &MemoryProjectStore, attachments_dir: &Path) -> Result<()> {
    store.put_project(project()).await;
    for (id, parent, name) in [(1, None, "Checkout"), (2, Some(1), "Payment")] {
        store
            .put_section(Section {
                id,
                project_id: 1,
                parent_id: parent,
                name: name.to_string(),
                description: None,
                position: 0,
                created_at: ts(0),
                updated_at: ts(0),
            })
            .await;
    }
    store.put_test_case(test_case(3, Some(2), "Pay with card", 0)).await;
    store.put_test_case(test_case(4, Some(1), "Apply coupon", 0)).await;
    store
        .put_test_plan(TestPlan {
            id: 5,
            project_id: 1,
            name: "Release 2.4".to_string(),
            description: None,
            status: "active".to_string(),
            test_case_ids: vec![4, 3],
            created_at: ts(0),
            updated_at: ts(0),
        })
        .await;
    store
        .put_test_run(TestRun {
            id: 6,
            project_id: 1,
            plan_id: Some(5),
            name: "Release 2.4 smoke".to_string(),
            status: "completed".to_string(),
            started_at: Some(ts(10)),
            completed_at: Some(ts(20)),
            results: [3, 4]
                .into_iter()
                .map(|test_case_id| RunResult {
                    test_case_id,
                    status: "passed".to_string(),
                    comment: None,
                    executed_at: Some(ts(15)),
                })
                .collect(),
            created_at: ts(10),
            updated_at: ts(20),
        })
        .await;

    std::fs::create_dir_all(attachments_dir)?;
    std::fs::write(attachments_dir.join("a1b2-receipt.png"), b"\x89PNG\r\n")?;
    store
        .put_attachment(Attachment {
            id: 7,
            project_id: 1,
            test_case_id: Some(3),
            original_name: "receipt.png".to_string(),
            stored_name: "a1b2-receipt.png".to_string(),
            mime_type: Some("image/png".to_string()),
            size_bytes: 6,
            created_at: ts(0),
        })
        .await;
    Ok(())
}

/// One installation: its own database, working directories and uploads.
pub struct Installation {
    pub store: Arc<MemoryProjectStore>,
    pub service: SyncService<MemoryProjectStore>,
    pub attachments_dir: PathBuf,
}

impl Installation {
    pub async fn new(root: &Path, name: &str, seeded: bool, policy: ConflictPolicy) -> Result<Self> {
        let attachments_dir = root.join(name).join("uploads");
        let config = SyncConfig {
            work_dir: root.join(name).join("git"),
            attachments_dir: attachments_dir.clone(),
            conflict_policy: policy,
            author_name: format!("casesync {name}"),
            author_email: format!("{name}@example.com"),
            ..SyncConfig::default()
        };

        let store = Arc::new(MemoryProjectStore::new());
        if seeded {
            seed(&store, &attachments_dir).await?;
        } else {
            store.put_project(project()).await;
        }

        let service = SyncService::new(store.clone(), config);
        Ok(Self {
            store,
            service,
            attachments_dir,
        })
    }
}

/// A bare repository standing in for the hosted remote
pub struct BareRemote {
    pub dir: TempDir,
    pub url: String,
}

impl BareRemote {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("qa-data.git");
        git2::Repository::init_bare(&path)?;
        let url = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in remote path"))?
            .to_string();
        Ok(Self { dir, url })
    }
}
