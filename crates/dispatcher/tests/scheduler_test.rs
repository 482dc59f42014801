use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edgefleet_core::{FleetError, JsonMap};
use edgefleet_dispatcher::{FnExecutorFactory, Scheduler, SchedulerSpec, TaskContext};
use edgefleet_domain::{
    GoroutinePoolSpec, Task, TaskPhase, TaskRepository, TaskSpec, TaskStatus, TaskStatusUpdate,
};
use edgefleet_infrastructure::DatabaseManager;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const POOL: &str = "default";
const WAIT: Duration = Duration::from_secs(5);

fn scheduler_spec() -> SchedulerSpec {
    SchedulerSpec {
        max_active_tasks: 100,
        allowed_max_tasks_in_db: 1000,
        max_history_master_tasks: 100,
    }
}

async fn new_repo() -> Arc<dyn TaskRepository> {
    DatabaseManager::in_memory().await.unwrap().task_repository()
}

struct Harness {
    scheduler: Arc<Scheduler>,
    repo: Arc<dyn TaskRepository>,
    release: CancellationToken,
}

/// 注册常用执行器：
/// - `echo`：直接成功
/// - `block`：等待 `release` 后成功
/// - `graceful`：等待优雅退出信号后以失败结束
/// - `delay`：按 `args.delay_ms` 延时后成功
async fn harness_with(repo: Arc<dyn TaskRepository>, spec: SchedulerSpec) -> Harness {
    let scheduler = Scheduler::start(repo.clone(), spec, CancellationToken::new())
        .await
        .unwrap();
    scheduler.register_goroutine_pool(GoroutinePoolSpec::new(POOL, 8, 32));

    scheduler.register_executor_factory(FnExecutorFactory::arc("echo", |ctx: TaskContext| async move {
        ctx.update_status(
            TaskStatusUpdate::phase(TaskPhase::Succeeded)
                .with_progress(100)
                .with_message("完成"),
        )
        .await
        .unwrap();
    }));

    let release = CancellationToken::new();
    let released = release.clone();
    scheduler.register_executor_factory(FnExecutorFactory::arc("block", move |ctx: TaskContext| {
        let released = released.clone();
        async move {
            released.cancelled().await;
            let _ = ctx.update_status(TaskStatusUpdate::phase(TaskPhase::Succeeded)).await;
        }
    }));

    scheduler.register_executor_factory(FnExecutorFactory::arc("graceful", |ctx: TaskContext| async move {
        ctx.graceful_shutdown().cancelled().await;
        let _ = ctx
            .update_status(TaskStatusUpdate::phase(TaskPhase::Failed).with_message("已清理"))
            .await;
    }));

    scheduler.register_executor_factory(FnExecutorFactory::arc("delay", |ctx: TaskContext| async move {
        let delay = ctx.spec().args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        sleep(Duration::from_millis(delay)).await;
        let _ = ctx.update_status(TaskStatusUpdate::phase(TaskPhase::Succeeded)).await;
    }));

    Harness {
        scheduler,
        repo,
        release,
    }
}

async fn harness() -> Harness {
    harness_with(new_repo().await, scheduler_spec()).await
}

async fn wait_done(scheduler: &Scheduler, id: &str) -> TaskStatus {
    let ctx = scheduler.get_task_context(id).await.unwrap();
    timeout(WAIT, ctx.done()).await.expect("任务未在限定时间内结束");
    ctx.get_status().await.unwrap()
}

async fn wait_phase(scheduler: &Scheduler, id: &str, phase: TaskPhase) {
    let deadline = Instant::now() + WAIT;
    loop {
        let ctx = scheduler.get_task_context(id).await.unwrap();
        if ctx.get_status().await.unwrap().phase == phase {
            return;
        }
        assert!(Instant::now() < deadline, "任务 {id} 未进入 {phase}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn args(value: serde_json::Value) -> JsonMap {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_submit_runs_to_success() {
    let h = harness().await;
    let spec = h
        .scheduler
        .submit_task(TaskSpec::new(POOL, "echo").with_name("测试任务"))
        .await
        .unwrap();
    assert_eq!(spec.id.len(), 24);

    let status = wait_done(&h.scheduler, &spec.id).await;
    assert_eq!(status.phase, TaskPhase::Succeeded);
    assert_eq!(status.progress, 100);
    assert_eq!(status.message, "完成");
    assert!(status.started_at.is_some());
    assert!(status.finished_at.is_some());
}

#[tokio::test]
async fn test_supplied_task_id_is_kept() {
    let h = harness().await;
    let mut spec = TaskSpec::new(POOL, "echo");
    spec.id = "edge-rotation-0001".to_string();
    let submitted = h.scheduler.submit_task(spec).await.unwrap();
    assert_eq!(submitted.id, "edge-rotation-0001");

    let status = wait_done(&h.scheduler, "edge-rotation-0001").await;
    assert_eq!(status.phase, TaskPhase::Succeeded);
    let stored = h.repo.get_task("edge-rotation-0001").await.unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_full_queue_rejects_and_rolls_back() {
    let h = harness().await;
    assert!(h
        .scheduler
        .register_goroutine_pool(GoroutinePoolSpec::new("single", 1, 1)));

    let first = h.scheduler.submit_task(TaskSpec::new("single", "block")).await.unwrap();
    wait_phase(&h.scheduler, &first.id, TaskPhase::Processing).await;
    let second = h.scheduler.submit_task(TaskSpec::new("single", "block")).await.unwrap();

    let err = h
        .scheduler
        .submit_task(TaskSpec::new("single", "block"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::FullQueue { ref pool } if pool == "single"));
    assert_eq!(h.repo.count_tasks().await.unwrap(), 2);
    assert_eq!(h.scheduler.active_task_count(), 2);

    h.release.cancel();
    assert_eq!(wait_done(&h.scheduler, &first.id).await.phase, TaskPhase::Succeeded);
    assert_eq!(wait_done(&h.scheduler, &second.id).await.phase, TaskPhase::Succeeded);
}

#[tokio::test]
async fn test_unfinished_tasks_fail_after_restart() {
    let repo = new_repo().await;
    repo.migrate().await.unwrap();
    let started = Utc::now() - chrono::Duration::minutes(5);
    let mut status = TaskStatus::waiting(started);
    status.phase = TaskPhase::Processing;
    status.started_at = Some(started);
    let mut spec = TaskSpec::new(POOL, "echo");
    spec.id = "0123456789abcdef01234567".to_string();
    repo.create_task(&Task { spec, status }).await.unwrap();

    let h = harness_with(repo.clone(), scheduler_spec()).await;
    let ctx = h
        .scheduler
        .get_task_context("0123456789abcdef01234567")
        .await
        .unwrap();
    assert!(ctx.is_done());
    let status = ctx.get_status().await.unwrap();
    assert_eq!(status.phase, TaskPhase::Failed);
    assert_eq!(status.reason, "interrupted");
    assert_eq!(
        status.started_at.map(|t| t.timestamp_millis()),
        Some(started.timestamp_millis())
    );
    assert!(status.finished_at.is_some());

    let err = ctx
        .update_status(TaskStatusUpdate::phase(TaskPhase::Succeeded))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::TaskAlreadyFinished));
}

#[tokio::test]
async fn test_missing_factory_fails_task() {
    let h = harness().await;
    let spec = h.scheduler.submit_task(TaskSpec::new(POOL, "missing")).await.unwrap();
    let status = wait_done(&h.scheduler, &spec.id).await;
    assert_eq!(status.phase, TaskPhase::Failed);
    assert_eq!(status.reason, "factory not found");
}

#[tokio::test]
async fn test_executor_panic_fails_task() {
    let h = harness().await;
    h.scheduler
        .register_executor_factory(FnExecutorFactory::arc("panic", |_ctx: TaskContext| async move {
            panic!("执行器异常");
        }));
    let spec = h.scheduler.submit_task(TaskSpec::new(POOL, "panic")).await.unwrap();
    let status = wait_done(&h.scheduler, &spec.id).await;
    assert_eq!(status.phase, TaskPhase::Failed);
    assert_eq!(status.reason, "executor panicked");
}

#[tokio::test]
async fn test_wait_timeout() {
    let h = harness().await;
    h.scheduler
        .register_goroutine_pool(GoroutinePoolSpec::new("single", 1, 4));
    let blocker = h.scheduler.submit_task(TaskSpec::new("single", "block")).await.unwrap();
    wait_phase(&h.scheduler, &blocker.id, TaskPhase::Processing).await;

    let waiting = h
        .scheduler
        .submit_task(TaskSpec::new("single", "echo").with_wait_timeout(Duration::from_millis(100)))
        .await
        .unwrap();
    let status = wait_done(&h.scheduler, &waiting.id).await;
    assert_eq!(status.phase, TaskPhase::Failed);
    assert_eq!(status.reason, "wait timeout");
    assert!(status.started_at.is_none());

    h.release.cancel();
    assert_eq!(wait_done(&h.scheduler, &blocker.id).await.phase, TaskPhase::Succeeded);
}

#[tokio::test]
async fn test_execute_timeout_triggers_graceful_shutdown() {
    let h = harness().await;
    let spec = h
        .scheduler
        .submit_task(
            TaskSpec::new(POOL, "graceful")
                .with_execute_timeout(Duration::from_millis(100))
                .with_graceful_shutdown_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let status = wait_done(&h.scheduler, &spec.id).await;
    assert_eq!(status.phase, TaskPhase::Failed);
    assert_eq!(status.reason, "execute timeout");
    assert_eq!(status.message, "已清理");
}

#[tokio::test]
async fn test_heartbeat_keeps_task_alive() {
    let h = harness().await;
    h.scheduler
        .register_executor_factory(FnExecutorFactory::arc("beating", |ctx: TaskContext| async move {
            for _ in 0..10 {
                ctx.update_liveness();
                sleep(Duration::from_millis(30)).await;
            }
            ctx.graceful_shutdown().cancelled().await;
            let _ = ctx.update_status(TaskStatusUpdate::phase(TaskPhase::Failed)).await;
        }));
    let started = Instant::now();
    let spec = h
        .scheduler
        .submit_task(
            TaskSpec::new(POOL, "beating")
                .with_heartbeat_timeout(Duration::from_millis(150))
                .with_graceful_shutdown_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let status = wait_done(&h.scheduler, &spec.id).await;
    assert_eq!(status.phase, TaskPhase::Failed);
    assert_eq!(status.reason, "heartbeat timeout");
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_graceful_shutdown_timeout() {
    let h = harness().await;
    h.scheduler
        .register_executor_factory(FnExecutorFactory::arc("stuck", |_ctx: TaskContext| {
            std::future::pending::<()>()
        }));
    let spec = h
        .scheduler
        .submit_task(
            TaskSpec::new(POOL, "stuck")
                .with_execute_timeout(Duration::from_millis(50))
                .with_graceful_shutdown_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    let status = wait_done(&h.scheduler, &spec.id).await;
    assert_eq!(status.phase, TaskPhase::Failed);
    assert_eq!(status.reason, "graceful shutdown timeout");
}

#[tokio::test]
async fn test_update_after_finish_is_rejected() {
    let h = harness().await;
    let (tx, mut rx) = mpsc::channel(1);
    h.scheduler
        .register_executor_factory(FnExecutorFactory::arc("twice", move |ctx: TaskContext| {
            let tx = tx.clone();
            async move {
                ctx.update_status(TaskStatusUpdate::phase(TaskPhase::Succeeded))
                    .await
                    .unwrap();
                let again = ctx.update_status(TaskStatusUpdate::default().with_progress(50)).await;
                let _ = tx.send(again).await;
            }
        }));
    let spec = h.scheduler.submit_task(TaskSpec::new(POOL, "twice")).await.unwrap();
    let again = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(again, Err(FleetError::TaskAlreadyFinished)));
    assert_eq!(wait_done(&h.scheduler, &spec.id).await.phase, TaskPhase::Succeeded);
}

#[tokio::test]
async fn test_user_cannot_abort() {
    let h = harness().await;
    let (tx, mut rx) = mpsc::channel(1);
    h.scheduler
        .register_executor_factory(FnExecutorFactory::arc("abort", move |ctx: TaskContext| {
            let tx = tx.clone();
            async move {
                let result = ctx.update_status(TaskStatusUpdate::phase(TaskPhase::Aborting)).await;
                let _ = tx.send(result).await;
                let _ = ctx.update_status(TaskStatusUpdate::phase(TaskPhase::Succeeded)).await;
            }
        }));
    let spec = h.scheduler.submit_task(TaskSpec::new(POOL, "abort")).await.unwrap();
    let result = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(result, Err(FleetError::TaskAlreadyFinished)));
    assert_eq!(wait_done(&h.scheduler, &spec.id).await.phase, TaskPhase::Succeeded);
}

#[tokio::test]
async fn test_cancel_cascades_to_children() {
    let h = harness().await;
    let graceful = || TaskSpec::new(POOL, "graceful").with_graceful_shutdown_timeout(Duration::from_secs(5));
    let master = h.scheduler.submit_task(graceful()).await.unwrap();
    let child = h
        .scheduler
        .submit_task(graceful().with_parent(master.id.clone()))
        .await
        .unwrap();
    wait_phase(&h.scheduler, &child.id, TaskPhase::Processing).await;

    h.scheduler.get_task_context(&master.id).await.unwrap().cancel();

    let master_status = wait_done(&h.scheduler, &master.id).await;
    assert_eq!(master_status.phase, TaskPhase::Failed);
    assert_eq!(master_status.reason, "cancelled");
    let child_status = wait_done(&h.scheduler, &child.id).await;
    assert_eq!(child_status.phase, TaskPhase::Failed);
    assert_eq!(child_status.reason, "cancelled");
    assert_eq!(child_status.message, "已清理");
}

#[tokio::test]
async fn test_sub_task_selector_returns_in_finish_order() {
    let h = harness().await;
    let master = h.scheduler.submit_task(TaskSpec::new(POOL, "block")).await.unwrap();
    let slow = h
        .scheduler
        .submit_task(
            TaskSpec::new(POOL, "delay")
                .with_parent(master.id.clone())
                .with_args(args(json!({ "delay_ms": 300 }))),
        )
        .await
        .unwrap();
    let fast = h
        .scheduler
        .submit_task(
            TaskSpec::new(POOL, "delay")
                .with_parent(master.id.clone())
                .with_args(args(json!({ "delay_ms": 20 }))),
        )
        .await
        .unwrap();

    let master_ctx = h.scheduler.get_task_context(&master.id).await.unwrap();
    let tree = master_ctx.get_sub_task_tree().await.unwrap();
    assert_eq!(tree.current.spec.id, master.id);
    let mut child_ids: Vec<String> = tree.children.iter().map(|c| c.current.spec.id.clone()).collect();
    child_ids.sort();
    let mut expected = vec![slow.id.clone(), fast.id.clone()];
    expected.sort();
    assert_eq!(child_ids, expected);

    let selector = h.scheduler.new_sub_task_selector(master.id.clone());
    let first = timeout(WAIT, selector.select(&[])).await.unwrap().unwrap();
    assert_eq!(first.id(), fast.id);
    let second = timeout(WAIT, selector.select(&[])).await.unwrap().unwrap();
    assert_eq!(second.id(), slow.id);
    assert!(matches!(
        selector.select(&[]).await,
        Err(FleetError::NoRunningSubTask)
    ));

    h.release.cancel();
    assert_eq!(wait_done(&h.scheduler, &master.id).await.phase, TaskPhase::Succeeded);
}

#[tokio::test]
async fn test_sub_task_selector_cancelled() {
    let h = harness().await;
    let master = h.scheduler.submit_task(TaskSpec::new(POOL, "block")).await.unwrap();
    h.scheduler
        .submit_task(TaskSpec::new(POOL, "block").with_parent(master.id.clone()))
        .await
        .unwrap();

    let selector = h.scheduler.new_sub_task_selector(master.id.clone());
    let stop = CancellationToken::new();
    let stopper = stop.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });
    let result = timeout(WAIT, selector.select(&[stop])).await.unwrap();
    assert!(matches!(result, Err(FleetError::Cancelled)));
    h.release.cancel();
}

#[tokio::test]
async fn test_concurrent_selects_return_distinct_children() {
    let h = harness().await;
    let master = h.scheduler.submit_task(TaskSpec::new(POOL, "block")).await.unwrap();
    let mut ids = Vec::new();
    for delay_ms in [20, 150] {
        let child = h
            .scheduler
            .submit_task(
                TaskSpec::new(POOL, "delay")
                    .with_parent(master.id.clone())
                    .with_args(args(json!({ "delay_ms": delay_ms }))),
            )
            .await
            .unwrap();
        ids.push(child.id);
    }

    let selector = h.scheduler.new_sub_task_selector(master.id.clone());
    let (a, b) = timeout(WAIT, async { tokio::join!(selector.select(&[]), selector.select(&[])) })
        .await
        .unwrap();
    let mut got = vec![a.unwrap().id().to_string(), b.unwrap().id().to_string()];
    got.sort();
    ids.sort();
    assert_eq!(got, ids);
    assert!(matches!(
        selector.select(&[]).await,
        Err(FleetError::NoRunningSubTask)
    ));
    h.release.cancel();
}

#[tokio::test]
async fn test_history_cap_deletes_oldest_trees() {
    let spec = SchedulerSpec {
        max_history_master_tasks: 2,
        ..scheduler_spec()
    };
    let h = harness_with(new_repo().await, spec).await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        let spec = h.scheduler.submit_task(TaskSpec::new(POOL, "echo")).await.unwrap();
        wait_done(&h.scheduler, &spec.id).await;
        ids.push(spec.id);
    }

    let deadline = Instant::now() + WAIT;
    loop {
        let finished = h.repo.get_finished_master_tasks().await.unwrap();
        if finished.len() <= 2 && h.scheduler.active_task_count() == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "历史任务未被回收");
        sleep(Duration::from_millis(20)).await;
    }
    assert!(h.repo.get_task(&ids[0]).await.unwrap().is_none());
    assert!(h.repo.get_task(&ids[1]).await.unwrap().is_none());
    assert!(h.repo.get_task(&ids[3]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_too_many_active_tasks() {
    let spec = SchedulerSpec {
        max_active_tasks: 1,
        ..scheduler_spec()
    };
    let h = harness_with(new_repo().await, spec).await;
    let first = h.scheduler.submit_task(TaskSpec::new(POOL, "block")).await.unwrap();
    let err = h
        .scheduler
        .submit_task(TaskSpec::new(POOL, "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::TooManyTask));
    assert_eq!(h.scheduler.active_task_count(), 1);

    h.release.cancel();
    wait_done(&h.scheduler, &first.id).await;
}

#[tokio::test]
async fn test_task_count_in_db_exceeded() {
    let spec = SchedulerSpec {
        allowed_max_tasks_in_db: 1,
        ..scheduler_spec()
    };
    let h = harness_with(new_repo().await, spec).await;
    let first = h.scheduler.submit_task(TaskSpec::new(POOL, "block")).await.unwrap();
    let err = h
        .scheduler
        .submit_task(TaskSpec::new(POOL, "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::TaskCountExceeded { max: 1 }));
    assert_eq!(h.scheduler.active_task_count(), 1);

    h.release.cancel();
    wait_done(&h.scheduler, &first.id).await;
}

#[tokio::test]
async fn test_unknown_pool_and_parent() {
    let h = harness().await;
    let err = h
        .scheduler
        .submit_task(TaskSpec::new("missing", "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::GoroutinePoolNotFound { ref pool } if pool == "missing"));
    assert_eq!(h.repo.count_tasks().await.unwrap(), 0);
    assert_eq!(h.scheduler.active_task_count(), 0);

    let err = h
        .scheduler
        .submit_task(TaskSpec::new(POOL, "echo").with_parent("ffffffffffffffffffffffff"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::TaskNotFound { .. }));
    assert!(matches!(
        h.scheduler.get_task_context("ffffffffffffffffffffffff").await,
        Err(FleetError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn test_register_is_load_or_store() {
    let h = harness().await;
    assert!(!h.scheduler.register_goroutine_pool(GoroutinePoolSpec::new(POOL, 1, 1)));
    assert!(!h
        .scheduler
        .register_executor_factory(FnExecutorFactory::arc("echo", |_ctx: TaskContext| async {})));
}

#[tokio::test]
async fn test_submit_after_shutdown() {
    let h = harness().await;
    h.scheduler.cancellation().cancel();
    let err = h
        .scheduler
        .submit_task(TaskSpec::new(POOL, "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Cancelled));
}
