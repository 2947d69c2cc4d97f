//! Integration tests for the pull-request projection and its audit trail.

use chrono::Utc;
use serde_json::json;

use forge_db::models::{PullRequestEventKind, PullRequestStatus};
use forge_db::pool;
use forge_db::queries::{projects, pull_requests};

use forge_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn opening_a_pull_request_logs_an_opened_event() {
    let (db, db_name) = create_test_db().await;
    pool::run_migrations(&db).await.expect("migrate");

    let project = projects::insert_project(&db, "demo", "/repos/demo", "main")
        .await
        .expect("insert project");

    let pr = pull_requests::insert_pull_request(
        &db,
        project.id,
        "Add retry backoff",
        Some("implements bounded exponential backoff"),
        "forge/step-a",
        "main",
        "agent:forge",
    )
    .await
    .expect("insert pull request");

    assert_eq!(pr.status, PullRequestStatus::Open);

    let events = pull_requests::list_pull_request_events(&db, pr.id)
        .await
        .expect("list events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, PullRequestEventKind::Opened);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn adding_a_commit_logs_a_commit_added_event() {
    let (db, db_name) = create_test_db().await;
    pool::run_migrations(&db).await.expect("migrate");

    let project = projects::insert_project(&db, "demo", "/repos/demo", "main")
        .await
        .expect("insert project");
    let pr = pull_requests::insert_pull_request(
        &db, project.id, "title", None, "forge/step-a", "main", "agent:forge",
    )
    .await
    .expect("insert pull request");

    pull_requests::add_pull_request_commit(&db, pr.id, "deadbeef", Some("forge"), Utc::now())
        .await
        .expect("add commit");

    let commits = pull_requests::list_pull_request_commits(&db, pr.id)
        .await
        .expect("list commits");
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].commit_hash, "deadbeef");

    let events = pull_requests::list_pull_request_events(&db, pr.id)
        .await
        .expect("list events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, PullRequestEventKind::CommitAdded);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn closing_an_already_closed_pull_request_is_a_no_op() {
    let (db, db_name) = create_test_db().await;
    pool::run_migrations(&db).await.expect("migrate");

    let project = projects::insert_project(&db, "demo", "/repos/demo", "main")
        .await
        .expect("insert project");
    let pr = pull_requests::insert_pull_request(
        &db, project.id, "title", None, "forge/step-a", "main", "agent:forge",
    )
    .await
    .expect("insert pull request");

    let first = pull_requests::close_pull_request(&db, pr.id, PullRequestStatus::Merged, Some("ops"))
        .await
        .expect("close pull request");
    assert!(first);

    let second = pull_requests::close_pull_request(&db, pr.id, PullRequestStatus::Merged, Some("ops"))
        .await
        .expect("close pull request again");
    assert!(!second, "a merged PR cannot be merged again");

    let events = pull_requests::list_pull_request_events(&db, pr.id)
        .await
        .expect("list events");
    assert_eq!(events.len(), 2, "no event should be logged for the no-op close");

    db.close().await;
    drop_test_db(&db_name).await;
}
