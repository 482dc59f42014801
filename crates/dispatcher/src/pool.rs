//! 协程池：固定数量的工作协程消费同一个有界队列

use std::sync::Arc;

use edgefleet_domain::{FleetError, FleetResult, GoroutinePoolSpec, TaskPhase, TaskStatusUpdate};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::{reason, TaskContext};
use crate::executor::ExecutorRegistry;

pub(crate) struct GoroutinePool {
    spec: GoroutinePoolSpec,
    sender: mpsc::Sender<TaskContext>,
}

impl GoroutinePool {
    /// 创建队列并启动 `max_concurrency` 个工作协程，容量为 0 时按 1 处理
    pub(crate) fn start(
        spec: GoroutinePoolSpec,
        executors: Arc<ExecutorRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(spec.max_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        for worker in 0..spec.max_concurrency.max(1) {
            tokio::spawn(run_worker(
                spec.id.clone(),
                worker,
                receiver.clone(),
                executors.clone(),
                cancel.clone(),
            ));
        }
        info!(
            pool = %spec.id,
            max_concurrency = spec.max_concurrency,
            max_capacity = spec.max_capacity,
            "协程池已启动"
        );
        Self { spec, sender }
    }

    pub(crate) fn spec(&self) -> &GoroutinePoolSpec {
        &self.spec
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<TaskContext> {
        self.sender.clone()
    }
}

/// 非阻塞入队
pub(crate) fn try_dispatch(
    pool_id: &str,
    sender: Option<&mpsc::Sender<TaskContext>>,
    ctx: TaskContext,
) -> FleetResult<()> {
    let not_found = || FleetError::GoroutinePoolNotFound {
        pool: pool_id.to_string(),
    };
    let sender = sender.ok_or_else(not_found)?;
    sender.try_send(ctx).map_err(|e| match e {
        TrySendError::Full(_) => FleetError::FullQueue {
            pool: pool_id.to_string(),
        },
        TrySendError::Closed(_) => not_found(),
    })
}

async fn run_worker(
    pool_id: String,
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<TaskContext>>>,
    executors: Arc<ExecutorRegistry>,
    cancel: CancellationToken,
) {
    debug!(pool = %pool_id, worker, "工作协程已启动");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            ctx = async { receiver.lock().await.recv().await } => ctx,
        };
        let Some(ctx) = next else {
            break;
        };
        process(ctx, &executors, &cancel).await;
    }
    debug!(pool = %pool_id, worker, "工作协程已退出");
}

async fn process(ctx: TaskContext, executors: &ExecutorRegistry, cancel: &CancellationToken) {
    if !ctx.wait_admitted().await {
        return;
    }
    if let Err(e) = ctx.system_update(TaskStatusUpdate::phase(TaskPhase::Processing)).await {
        debug!(task_id = %ctx.id(), "任务无法进入处理阶段，跳过: {}", e);
        return;
    }

    let Some(factory) = executors.get(&ctx.spec().command) else {
        error!(task_id = %ctx.id(), command = %ctx.spec().command, "未找到任务执行器");
        ctx.force_fail(reason::FACTORY_NOT_FOUND).await;
        return;
    };

    let handle = tokio::spawn(factory.create(&ctx));
    let watched = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(task_id = %watched.id(), "任务执行器发生 panic");
                watched.force_fail(reason::EXECUTOR_PANICKED).await;
            }
        }
    });

    tokio::select! {
        _ = ctx.done() => {}
        _ = cancel.cancelled() => {}
    }
}
