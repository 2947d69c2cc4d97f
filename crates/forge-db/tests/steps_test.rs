//! Integration tests for workflow step materialisation and the claim
//! protocol.

use serde_json::json;
use uuid::Uuid;

use forge_db::models::StepStatus;
use forge_db::pool;
use forge_db::queries::{projects, steps, workflows};

use forge_test_utils::{create_test_db, drop_test_db};

async fn seed_workflow(pool: &sqlx::PgPool) -> Uuid {
    let project = projects::insert_project(pool, "demo", "/repos/demo", "main")
        .await
        .expect("insert project");
    let workflow = workflows::insert_workflow(pool, project.id, "run-1", Some("feature"), json!({}))
        .await
        .expect("insert workflow");
    workflow.id
}

#[tokio::test]
async fn claim_step_wins_race_exactly_once() {
    let (db, db_name) = create_test_db().await;
    pool::run_migrations(&db).await.expect("migrate");

    let workflow_id = seed_workflow(&db).await;
    steps::insert_steps(
        &db,
        workflow_id,
        &[steps::NewStep {
            task_id: "a",
            sequence: 0,
            depends_on: vec![],
            data: json!({}),
        }],
    )
    .await
    .expect("insert steps");

    let step_id = format!("{workflow_id}:a");

    let first = steps::claim_step(&db, &step_id, "runner-1")
        .await
        .expect("claim attempt 1");
    let second = steps::claim_step(&db, &step_id, "runner-2")
        .await
        .expect("claim attempt 2");

    assert!(first, "first claimant should win");
    assert!(!second, "second claimant should lose the race");

    let step = steps::get_step(&db, &step_id)
        .await
        .expect("get step")
        .expect("step exists");
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.runner_instance_id.as_deref(), Some("runner-1"));
    assert_eq!(step.runner_attempts, 1);

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ready_steps_respect_dependencies() {
    let (db, db_name) = create_test_db().await;
    pool::run_migrations(&db).await.expect("migrate");

    let workflow_id = seed_workflow(&db).await;
    steps::insert_steps(
        &db,
        workflow_id,
        &[
            steps::NewStep { task_id: "a", sequence: 0, depends_on: vec![], data: json!({}) },
            steps::NewStep {
                task_id: "b",
                sequence: 1,
                depends_on: vec![format!("{workflow_id}:a")],
                data: json!({}),
            },
        ],
    )
    .await
    .expect("insert steps");

    let ready = steps::get_ready_steps(&db, workflow_id).await.expect("ready steps");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, format!("{workflow_id}:a"));

    let a_id = format!("{workflow_id}:a");
    steps::claim_step(&db, &a_id, "runner-1").await.expect("claim a");
    steps::complete_step(&db, &a_id, "runner-1", StepStatus::Completed, json!({"ok": true}))
        .await
        .expect("complete a");

    let ready = steps::get_ready_steps(&db, workflow_id).await.expect("ready steps after a");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, format!("{workflow_id}:b"));

    db.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_running_steps_are_reset() {
    let (db, db_name) = create_test_db().await;
    pool::run_migrations(&db).await.expect("migrate");

    let workflow_id = seed_workflow(&db).await;
    steps::insert_steps(
        &db,
        workflow_id,
        &[steps::NewStep { task_id: "a", sequence: 0, depends_on: vec![], data: json!({}) }],
    )
    .await
    .expect("insert steps");

    let step_id = format!("{workflow_id}:a");
    steps::claim_step(&db, &step_id, "runner-1").await.expect("claim");

    sqlx::query("UPDATE workflow_steps SET updated_at = now() - interval '1 hour' WHERE id = $1")
        .bind(&step_id)
        .execute(&db)
        .await
        .expect("backdate updated_at");

    let reset = steps::reset_stale_running_steps(&db, 15).await.expect("reset stale");
    assert_eq!(reset.len(), 1);
    assert_eq!(reset[0].status, StepStatus::Pending);
    assert!(reset[0].runner_instance_id.is_none());

    db.close().await;
    drop_test_db(&db_name).await;
}
