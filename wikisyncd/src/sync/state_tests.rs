use super::*;
use sqlx::sqlite::SqlitePoolOptions;

async fn make_store() -> StateStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn record(name: &str, version_id: i64) -> LocalFileRecord {
    LocalFileRecord {
        name: name.into(),
        version_id,
        digest: Some("0123456789abcdef0123456789abcdef".into()),
        etag: Some("\"e1\"".into()),
        size: 100,
        remote_modified: Some(1_717_322_400),
        downloaded_at: 1_717_400_000,
        unpacked_at: 1_717_400_010,
        artifact_name: "pages.xml".into(),
        artifact_size: 400,
        artifact_digest: "fedcba9876543210fedcba9876543210".into(),
    }
}

#[tokio::test]
async fn commit_promotion_records_version_and_latest() {
    let store = make_store().await;
    let first = record("pages.xml.bz2", 10);
    store.commit_promotion(&first, 100).await.unwrap();

    assert_eq!(
        store.get_record("pages.xml.bz2", 10).await.unwrap(),
        Some(first.clone())
    );
    assert_eq!(
        store.get_latest("pages.xml.bz2").await.unwrap(),
        Some(LatestRecord {
            name: "pages.xml.bz2".into(),
            version_id: 10,
            promoted_at: 100,
        })
    );

    let second = record("pages.xml.bz2", 20);
    store.commit_promotion(&second, 200).await.unwrap();
    assert_eq!(
        store
            .get_latest("pages.xml.bz2")
            .await
            .unwrap()
            .map(|latest| latest.version_id),
        Some(20)
    );
    let versions: Vec<_> = store
        .list_records("pages.xml.bz2")
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.version_id)
        .collect();
    assert_eq!(versions, vec![20, 10]);
    assert_eq!(store.max_version_id("pages.xml.bz2").await.unwrap(), Some(20));
    assert_eq!(store.max_version_id("other").await.unwrap(), None);
}

#[tokio::test]
async fn latest_records_join_their_versions() {
    let store = make_store().await;
    store
        .commit_promotion(&record("page.sql.gz", 5), 50)
        .await
        .unwrap();
    store
        .commit_promotion(&record("langlinks.sql.gz", 7), 70)
        .await
        .unwrap();

    let latest = store.latest_records().await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].0.name, "langlinks.sql.gz");
    assert_eq!(latest[0].1.version_id, 7);
    assert_eq!(latest[1].0.promoted_at, 50);
    assert_eq!(
        store.tracked_names().await.unwrap(),
        vec!["langlinks.sql.gz".to_string(), "page.sql.gz".to_string()]
    );
}

#[tokio::test]
async fn latest_version_cannot_be_deleted() {
    let store = make_store().await;
    store
        .commit_promotion(&record("page.sql.gz", 1), 1)
        .await
        .unwrap();
    store
        .commit_promotion(&record("page.sql.gz", 2), 2)
        .await
        .unwrap();

    store.delete_record("page.sql.gz", 1).await.unwrap();
    assert!(store.get_record("page.sql.gz", 1).await.unwrap().is_none());

    assert!(store.delete_record("page.sql.gz", 2).await.is_err());
    assert!(store.get_record("page.sql.gz", 2).await.unwrap().is_some());
}

#[tokio::test]
async fn runs_round_trip_with_failures() {
    let store = make_store().await;
    assert!(store.last_run().await.unwrap().is_none());

    let mut run = RunRecord::started(1_000);
    run.finished_at = 1_100;
    run.files_planned = 3;
    run.files_transferred = 1;
    run.bytes_transferred = 4_096;
    run.record_failure(FileFailure {
        name: "page.sql.gz".into(),
        kind: FailureKind::IntegrityMismatch,
        message: "digest mismatch".into(),
    });
    run.record_failure(FileFailure {
        name: "langlinks.sql.gz".into(),
        kind: FailureKind::InsufficientResources,
        message: "free disk below threshold".into(),
    });
    run.outcome = RunOutcome::PartialFailure;

    let id = store.insert_run(&run).await.unwrap();
    let stored = store.last_run().await.unwrap().unwrap();

    assert_eq!(stored.id, id);
    assert_eq!(stored.outcome, RunOutcome::PartialFailure);
    assert_eq!(stored.files_failed, 1);
    assert_eq!(stored.files_deferred, 1);
    assert_eq!(stored.failures, run.failures);

    let mut next = RunRecord::started(2_000);
    next.outcome = RunOutcome::SkippedInsufficientResources;
    store.insert_run(&next).await.unwrap();
    let recent = store.recent_runs(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].outcome, RunOutcome::SkippedInsufficientResources);
}

#[test]
fn outcomes_round_trip_through_text() {
    for outcome in [
        RunOutcome::Succeeded,
        RunOutcome::PartialFailure,
        RunOutcome::SkippedInsufficientResources,
        RunOutcome::Failed,
        RunOutcome::Cancelled,
    ] {
        assert_eq!(RunOutcome::parse(outcome.as_str()).unwrap(), outcome);
    }
    assert!(RunOutcome::parse("exploded").is_err());
}
