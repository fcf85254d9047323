// Two installations sharing one remote: edits, deletions and conflicting
// edits of the same test case.

mod sync_test_helpers;

use anyhow::Result;
use casesync::git::ResolvedConflict;
use casesync::{
    ConflictPolicy, ConflictSide, EntityKind, GitSettingsUpdate, ProjectStore, ReconcileOutcome,
};
use pretty_assertions::assert_eq;
use sync_test_helpers::{test_case, BareRemote, Installation};
use tempfile::TempDir;

fn remote_settings(url: &str) -> GitSettingsUpdate {
    GitSettingsUpdate {
        remote_url: Some(url.to_string()),
        ..GitSettingsUpdate::default()
    }
}

/// `first` publishes the seeded project, `second` adopts it.
async fn connected_pair(
    root: &std::path::Path,
    remote: &BareRemote,
    second_policy: ConflictPolicy,
) -> Result<(Installation, Installation)> {
    let first = Installation::new(root, "first", true, ConflictPolicy::NewestWins).await?;
    let second = Installation::new(root, "second", false, second_policy).await?;
    first.service.configure(1, remote_settings(&remote.url)).await?;
    second.service.configure(1, remote_settings(&remote.url)).await?;

    let published = first.service.push(1).await?;
    assert!(published.pushed);
    let adopted = second.service.sync(1).await?;
    assert_eq!(adopted.commit, None);
    assert_eq!(second.store.list_test_cases(1).await?.len(), 2);
    Ok((first, second))
}

async fn case_title(installation: &Installation, id: i64) -> Result<String> {
    let cases = installation.store.list_test_cases(1).await?;
    cases
        .into_iter()
        .find(|case| case.id == id)
        .map(|case| case.title)
        .ok_or_else(|| anyhow::anyhow!("test case {id} missing"))
}

#[tokio::test]
async fn test_first_sync_keeps_remote_rows() -> Result<()> {
    let root = TempDir::new()?;
    let remote = BareRemote::new()?;
    let (_first, second) = connected_pair(root.path(), &remote, ConflictPolicy::NewestWins).await?;

    let plans = second.store.list_test_plans(1).await?;
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].test_case_ids, vec![4, 3]);

    let attachments = second.store.list_attachments(1).await?;
    assert_eq!(attachments.len(), 1);
    let binary = second.attachments_dir.join(&attachments[0].stored_name);
    assert_eq!(std::fs::read(binary)?, b"\x89PNG\r\n");

    let settings = second.service.get_settings(1).await?;
    assert!(settings.last_sync_at.is_some());
    assert!(settings.last_commit.is_some());
    Ok(())
}

#[tokio::test]
async fn test_deletion_reaches_other_installation() -> Result<()> {
    let root = TempDir::new()?;
    let remote = BareRemote::new()?;
    let (first, second) = connected_pair(root.path(), &remote, ConflictPolicy::NewestWins).await?;

    second
        .store
        .soft_delete_missing(1, EntityKind::TestCase, &[3])
        .await?;
    let report = second.service.sync(1).await?;
    assert!(report.commit.is_some());
    assert!(report.pushed);
    let exported = report.export.expect("sync exports first");
    assert_eq!(exported.files_removed, 1);

    let report = first.service.sync(1).await?;
    assert_eq!(report.commit, None);
    assert!(matches!(
        report.reconcile,
        Some(ReconcileOutcome::FastForward { .. })
    ));
    let imported = report.import.expect("sync imports the reconciled tree");
    assert_eq!(imported.deleted.get(&EntityKind::TestCase), Some(&1));
    // The plan entry and the run result for the removed case
    assert_eq!(imported.dangling_references, 2);

    assert_eq!(
        first.store.is_deleted(EntityKind::TestCase, 4).await,
        Some(true)
    );
    let plans = first.store.list_test_plans(1).await?;
    assert_eq!(plans[0].test_case_ids, vec![3]);
    let runs = first.store.list_test_runs(1).await?;
    assert_eq!(runs[0].results.len(), 1);
    assert_eq!(runs[0].results[0].test_case_id, 3);
    Ok(())
}

#[tokio::test]
async fn test_conflicting_edits_newest_wins() -> Result<()> {
    let root = TempDir::new()?;
    let remote = BareRemote::new()?;
    let (first, second) = connected_pair(root.path(), &remote, ConflictPolicy::NewestWins).await?;

    first
        .store
        .put_test_case(test_case(3, Some(2), "Pay with saved card", 60))
        .await;
    assert!(first.service.sync(1).await?.pushed);

    // Edited on the second installation, but earlier
    second
        .store
        .put_test_case(test_case(3, Some(2), "Pay with new card", 30))
        .await;
    let report = second.service.sync(1).await?;
    assert!(report.commit.is_some());
    assert_eq!(
        report.conflicts.resolved,
        vec![ResolvedConflict {
            path: "test_cases/3.json".to_string(),
            side: ConflictSide::Remote,
            deleted: false,
        }]
    );
    assert!(report.conflicts.unresolved.is_empty());

    assert_eq!(case_title(&second, 3).await?, "Pay with saved card");
    assert_eq!(case_title(&first, 3).await?, "Pay with saved card");
    Ok(())
}

#[tokio::test]
async fn test_conflicting_edits_prefer_local() -> Result<()> {
    let root = TempDir::new()?;
    let remote = BareRemote::new()?;
    let (first, second) = connected_pair(root.path(), &remote, ConflictPolicy::PreferLocal).await?;

    first
        .store
        .put_test_case(test_case(3, Some(2), "Pay with saved card", 60))
        .await;
    first.service.sync(1).await?;

    second
        .store
        .put_test_case(test_case(3, Some(2), "Pay with new card", 30))
        .await;
    let report = second.service.sync(1).await?;
    assert!(report.pushed);
    assert_eq!(report.conflicts.resolved.len(), 1);
    assert_eq!(report.conflicts.resolved[0].side, ConflictSide::Local);
    assert_eq!(case_title(&second, 3).await?, "Pay with new card");

    let report = first.service.sync(1).await?;
    assert!(report.conflicts.resolved.is_empty());
    assert_eq!(case_title(&first, 3).await?, "Pay with new card");
    Ok(())
}

#[tokio::test]
async fn test_independent_edits_merge_cleanly() -> Result<()> {
    let root = TempDir::new()?;
    let remote = BareRemote::new()?;
    let (first, second) = connected_pair(root.path(), &remote, ConflictPolicy::NewestWins).await?;

    first
        .store
        .put_test_case(test_case(3, Some(2), "Pay with saved card", 60))
        .await;
    first.service.sync(1).await?;

    second
        .store
        .put_test_case(test_case(4, Some(1), "Apply expired coupon", 45))
        .await;
    let report = second.service.sync(1).await?;
    assert!(matches!(
        report.reconcile,
        Some(ReconcileOutcome::Rebased { replayed: 1, .. })
    ));
    assert!(report.conflicts.resolved.is_empty());
    assert!(report.pushed);

    first.service.sync(1).await?;
    for installation in [&first, &second] {
        assert_eq!(case_title(installation, 3).await?, "Pay with saved card");
        assert_eq!(case_title(installation, 4).await?, "Apply expired coupon");
    }

    let first_status = first.service.status(1).await?;
    let second_status = second.service.status(1).await?;
    let first_repo = first_status.repository.expect("initialized");
    let second_repo = second_status.repository.expect("initialized");
    assert_eq!(first_repo.head, second_repo.head);
    assert_eq!(first_repo.ahead, 0);
    assert_eq!(first_repo.behind, 0);
    Ok(())
}
