//! Record builders and a seeded store shared by the sync unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;

use crate::model::{
    Attachment, Project, RunResult, Section, TestCase, TestPlan, TestRun, TestStep,
};
use crate::store::MemoryProjectStore;

pub fn ts(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn project(id: i64) -> Project {
    Project {
        id,
        name: format!("Project {id}"),
        description: Some("Checkout regression suite".to_string()),
        created_at: ts(0),
        updated_at: ts(0),
    }
}

pub fn section(id: i64, project_id: i64, parent_id: Option<i64>, name: &str) -> Section {
    Section {
        id,
        project_id,
        parent_id,
        name: name.to_string(),
        description: None,
        position: 0,
        created_at: ts(0),
        updated_at: ts(0),
    }
}

pub fn test_case(id: i64, project_id: i64, section_id: Option<i64>, title: &str) -> TestCase {
    TestCase {
        id,
        project_id,
        section_id,
        title: title.to_string(),
        preconditions: None,
        steps: vec![TestStep {
            action: "Open the page".to_string(),
            expected: Some("Page renders".to_string()),
        }],
        expected_result: Some("Works".to_string()),
        priority: "medium".to_string(),
        case_type: "functional".to_string(),
        status: "active".to_string(),
        tags: vec!["smoke".to_string()],
        position: 0,
        created_at: ts(0),
        updated_at: ts(0),
    }
}

pub fn test_plan(id: i64, project_id: i64, test_case_ids: Vec<i64>) -> TestPlan {
    TestPlan {
        id,
        project_id,
        name: format!("Plan {id}"),
        description: None,
        status: "draft".to_string(),
        test_case_ids,
        created_at: ts(0),
        updated_at: ts(0),
    }
}

pub fn test_run(id: i64, project_id: i64, plan_id: Option<i64>, case_ids: &[i64]) -> TestRun {
    TestRun {
        id,
        project_id,
        plan_id,
        name: format!("Run {id}"),
        status: "in_progress".to_string(),
        started_at: Some(ts(5)),
        completed_at: None,
        results: case_ids
            .iter()
            .map(|&test_case_id| RunResult {
                test_case_id,
                status: "passed".to_string(),
                comment: None,
                executed_at: Some(ts(6)),
            })
            .collect(),
        created_at: ts(0),
        updated_at: ts(0),
    }
}

pub fn attachment(id: i64, project_id: i64, test_case_id: Option<i64>, name: &str) -> Attachment {
    Attachment {
        id,
        project_id,
        test_case_id,
        original_name: name.to_string(),
        stored_name: format!("stored-{id}-{name}"),
        mime_type: Some("image/png".to_string()),
        size_bytes: 4,
        created_at: ts(0),
    }
}

/// Project 1 with a two-level section tree, two cases, a plan, a run and one
/// attachment whose binary is written into `attachments_dir`.
pub async fn seeded_store(attachments_dir: &Path) -> MemoryProjectStore {
    let store = MemoryProjectStore::new();
    store.put_project(project(1)).await;
    store.put_section(section(1, 1, None, "Checkout")).await;
    store.put_section(section(2, 1, Some(1), "Payment")).await;
    store
        .put_test_case(test_case(3, 1, Some(2), "Pay with card"))
        .await;
    store
        .put_test_case(test_case(4, 1, Some(1), "Apply coupon"))
        .await;
    store.put_test_plan(test_plan(5, 1, vec![4, 3])).await;
    store.put_test_run(test_run(6, 1, Some(5), &[3, 4])).await;

    let att = attachment(7, 1, Some(3), "receipt.png");
    std::fs::create_dir_all(attachments_dir).unwrap();
    std::fs::write(attachments_dir.join(&att.stored_name), b"\x89PNG").unwrap();
    store.put_attachment(att).await;

    store
}
