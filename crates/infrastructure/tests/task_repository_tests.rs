use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use edgefleet_core::FleetError;
use edgefleet_domain::{Task, TaskPhase, TaskRepository, TaskSpec, TaskStatus, TaskStatusUpdate};
use edgefleet_infrastructure::DatabaseManager;
use serde_json::json;

async fn setup() -> Result<std::sync::Arc<dyn TaskRepository>> {
    let manager = DatabaseManager::in_memory().await?;
    let repo = manager.task_repository();
    repo.migrate().await?;
    Ok(repo)
}

fn new_task(id: &str, parent_id: &str) -> Task {
    let mut args = serde_json::Map::new();
    args.insert("target".to_string(), json!("node-1"));
    Task {
        spec: TaskSpec {
            id: id.to_string(),
            name: format!("task-{id}"),
            parent_id: parent_id.to_string(),
            args,
            wait_timeout: Duration::from_secs(5),
            execute_timeout: Duration::from_millis(1500),
            ..TaskSpec::new("default", "echo")
        },
        status: TaskStatus::waiting(Utc::now()),
    }
}

#[tokio::test]
async fn test_create_and_get_task() -> Result<()> {
    let repo = setup().await?;
    let task = new_task("aaaa", "");
    repo.create_task(&task).await?;

    let loaded = repo.get_task("aaaa").await?.expect("任务应存在");
    assert_eq!(loaded.spec, task.spec);
    assert_eq!(loaded.status.phase, TaskPhase::Waiting);
    assert_eq!(loaded.spec.execute_timeout, Duration::from_millis(1500));
    assert!(loaded.status.created_at.is_some());
    assert_eq!(repo.count_tasks().await?, 1);

    assert!(repo.get_task("missing").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_update_status_only_touches_unfinished() -> Result<()> {
    let repo = setup().await?;
    repo.create_task(&new_task("t1", "")).await?;

    let (task, rows) = repo
        .update_task_status("t1", &TaskStatusUpdate::phase(TaskPhase::Processing))
        .await?;
    assert_eq!(rows, 1);
    assert_eq!(task.status.phase, TaskPhase::Processing);
    assert!(task.status.started_at.is_some());

    let (task, rows) = repo
        .update_task_status(
            "t1",
            &TaskStatusUpdate::phase(TaskPhase::Succeeded).with_message("完成"),
        )
        .await?;
    assert_eq!(rows, 1);
    assert!(task.status.finished_at.is_some());

    let (task, rows) = repo
        .update_task_status("t1", &TaskStatusUpdate::phase(TaskPhase::Failed))
        .await?;
    assert_eq!(rows, 0);
    assert_eq!(task.status.phase, TaskPhase::Succeeded);

    let stored = repo.get_task("t1").await?.unwrap();
    assert_eq!(stored.status.phase, TaskPhase::Succeeded);
    assert_eq!(stored.status.message, "完成");

    let missing = repo
        .update_task_status("nope", &TaskStatusUpdate::default())
        .await;
    assert!(matches!(missing, Err(FleetError::TaskNotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_submit_in_transaction_respects_limit_and_rolls_back() -> Result<()> {
    let repo = setup().await?;

    repo.submit_in_transaction(&new_task("s1", ""), 2, Box::new(|| Ok(())))
        .await?;

    let failed = repo
        .submit_in_transaction(
            &new_task("s2", ""),
            2,
            Box::new(|| Err(FleetError::FullQueue { pool: "default".to_string() })),
        )
        .await;
    assert!(matches!(failed, Err(FleetError::FullQueue { .. })));
    assert!(repo.get_task("s2").await?.is_none());

    repo.submit_in_transaction(&new_task("s3", ""), 2, Box::new(|| Ok(())))
        .await?;
    let exceeded = repo
        .submit_in_transaction(&new_task("s4", ""), 2, Box::new(|| Ok(())))
        .await;
    assert!(matches!(exceeded, Err(FleetError::TaskCountExceeded { max: 2 })));
    assert_eq!(repo.count_tasks().await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_task_tree_and_finished_masters() -> Result<()> {
    let repo = setup().await?;
    repo.create_task(&new_task("root", "")).await?;
    repo.create_task(&new_task("c1", "root")).await?;
    repo.create_task(&new_task("c2", "root")).await?;
    repo.create_task(&new_task("g1", "c1")).await?;
    repo.create_task(&new_task("other", "")).await?;

    let tree = repo.get_task_tree("root").await?.unwrap();
    assert_eq!(tree.children.len(), 2);
    let c1 = tree.children.iter().find(|c| c.current.id() == "c1").unwrap();
    assert_eq!(c1.children.len(), 1);
    assert_eq!(c1.children[0].current.id(), "g1");

    let mut visited = Vec::new();
    tree.walk(&mut |t| visited.push(t.spec.id.clone()));
    assert_eq!(visited.last().map(String::as_str), Some("root"));
    assert_eq!(visited.len(), 4);

    repo.update_task_status("root", &TaskStatusUpdate::phase(TaskPhase::Failed))
        .await?;
    repo.update_task_status("c1", &TaskStatusUpdate::phase(TaskPhase::Succeeded))
        .await?;
    let masters = repo.get_finished_master_tasks().await?;
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].id(), "root");

    assert_eq!(repo.delete_task("g1").await?, 1);
    assert_eq!(repo.delete_task("g1").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_unfinished_tasks_marked_failed_on_restart() -> Result<()> {
    let repo = setup().await?;
    repo.create_task(&new_task("w", "")).await?;
    repo.create_task(&new_task("p", "")).await?;
    repo.create_task(&new_task("done", "")).await?;
    let (processing, _) = repo
        .update_task_status("p", &TaskStatusUpdate::phase(TaskPhase::Processing))
        .await?;
    repo.update_task_status("done", &TaskStatusUpdate::phase(TaskPhase::Succeeded))
        .await?;

    assert_eq!(repo.update_unfinished_tasks_to_failed("interrupted").await?, 2);

    let p = repo.get_task("p").await?.unwrap();
    assert_eq!(p.status.phase, TaskPhase::Failed);
    assert_eq!(p.status.reason, "interrupted");
    assert_eq!(p.status.started_at, processing.status.started_at);
    assert!(p.status.finished_at.is_some());

    let w = repo.get_task("w").await?.unwrap();
    assert!(w.status.started_at.is_none());

    let done = repo.get_task("done").await?.unwrap();
    assert_eq!(done.status.phase, TaskPhase::Succeeded);
    Ok(())
}
