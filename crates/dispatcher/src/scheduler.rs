//! 层级任务调度器
//!
//! 提交时在同一个事务里完成计数、落库与入队；活跃任务保存在内存索引中，
//! 主任务整棵树结束后由回收协程移出索引，并按历史上限删除最早结束的任务树。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::Utc;
use edgefleet_core::config::SchedulerConfig;
use edgefleet_core::ids::new_task_id;
use edgefleet_domain::{
    DispatchFn, FleetError, FleetResult, GoroutinePoolSpec, Task, TaskRepository, TaskSpec, TaskStatus,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{reason, TaskContext};
use crate::executor::{ExecutorRegistry, TaskExecutorFactory};
use crate::pool::{try_dispatch, GoroutinePool};
use crate::selector::SubTaskSelector;

const CAS_RETRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSpec {
    pub max_active_tasks: i64,
    pub allowed_max_tasks_in_db: i64,
    pub max_history_master_tasks: i64,
}

impl From<&SchedulerConfig> for SchedulerSpec {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_active_tasks: config.max_active_tasks,
            allowed_max_tasks_in_db: config.allowed_max_tasks_in_db,
            max_history_master_tasks: config.max_history_master_tasks,
        }
    }
}

type ActiveIndex = Arc<RwLock<HashMap<String, TaskContext>>>;

pub struct Scheduler {
    spec: SchedulerSpec,
    repo: Arc<dyn TaskRepository>,
    cancel: CancellationToken,
    executors: Arc<ExecutorRegistry>,
    pools: RwLock<HashMap<String, GoroutinePool>>,
    active: ActiveIndex,
    active_count: AtomicI64,
    done_tx: mpsc::Sender<()>,
}

impl Scheduler {
    /// 建表、把上次遗留的未结束任务置为失败并启动回收协程
    pub async fn start(
        repo: Arc<dyn TaskRepository>,
        spec: SchedulerSpec,
        cancel: CancellationToken,
    ) -> FleetResult<Arc<Self>> {
        repo.migrate().await?;
        let interrupted = repo.update_unfinished_tasks_to_failed(reason::INTERRUPTED).await?;
        if interrupted > 0 {
            warn!("{} 个遗留的未结束任务已置为失败", interrupted);
        }

        let (done_tx, done_rx) = mpsc::channel(1);
        let scheduler = Arc::new(Self {
            spec,
            repo,
            cancel: cancel.clone(),
            executors: Arc::new(ExecutorRegistry::default()),
            pools: RwLock::new(HashMap::new()),
            active: Arc::new(RwLock::new(HashMap::new())),
            active_count: AtomicI64::new(0),
            done_tx,
        });
        tokio::spawn(run_reaper(Arc::downgrade(&scheduler), done_rx, cancel));
        info!(
            max_active_tasks = spec.max_active_tasks,
            allowed_max_tasks_in_db = spec.allowed_max_tasks_in_db,
            "任务调度器已启动"
        );
        Ok(scheduler)
    }

    pub fn spec(&self) -> &SchedulerSpec {
        &self.spec
    }

    pub(crate) fn repo(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 内存索引中的任务数，包括已结束但尚未回收的任务
    pub fn active_task_count(&self) -> i64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// 同名工厂已存在时返回 false
    pub fn register_executor_factory(&self, factory: Arc<dyn TaskExecutorFactory>) -> bool {
        let id = factory.id().to_string();
        let registered = self.executors.register(factory);
        if registered {
            info!(command = %id, "任务执行器已注册");
        } else {
            debug!(command = %id, "任务执行器已存在");
        }
        registered
    }

    /// 同名协程池已存在时返回 false，工作协程只启动一次
    pub fn register_goroutine_pool(&self, spec: GoroutinePoolSpec) -> bool {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pools.get(&spec.id) {
            debug!(pool = %existing.spec().id, "协程池已存在");
            return false;
        }
        let id = spec.id.clone();
        let pool = GoroutinePool::start(spec, self.executors.clone(), self.cancel.clone());
        pools.insert(id, pool);
        true
    }

    /// 提交任务，未指定 ID 时分配新 ID，返回最终的任务定义
    pub async fn submit_task(&self, mut spec: TaskSpec) -> FleetResult<TaskSpec> {
        if self.cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }
        if spec.id.is_empty() {
            spec.id = new_task_id();
        }
        let parent_token = if spec.is_master() {
            self.cancel.clone()
        } else {
            self.active_context(&spec.parent_id)
                .ok_or_else(|| FleetError::TaskNotFound {
                    id: spec.parent_id.clone(),
                })?
                .cancellation()
        };

        let ctx = TaskContext::new(spec.clone(), &parent_token, self.repo.clone());
        self.acquire_slot()?;

        let task = Task {
            spec: spec.clone(),
            status: TaskStatus::waiting(Utc::now()),
        };
        let sender = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&spec.goroutine_pool)
            .map(GoroutinePool::sender);
        let active = self.active.clone();
        let dispatched = ctx.clone();
        let pool_id = spec.goroutine_pool.clone();
        let dispatch: DispatchFn = Box::new(move || {
            let id = dispatched.id().to_string();
            write_index(&active).insert(id.clone(), dispatched.clone());
            try_dispatch(&pool_id, sender.as_ref(), dispatched).inspect_err(|_| {
                write_index(&active).remove(&id);
            })
        });

        if let Err(e) = self
            .repo
            .submit_in_transaction(&task, self.spec.allowed_max_tasks_in_db, dispatch)
            .await
        {
            write_index(&self.active).remove(ctx.id());
            ctx.destroy();
            self.active_count.fetch_sub(1, Ordering::SeqCst);
            warn!(command = %spec.command, pool = %spec.goroutine_pool, "提交任务失败: {}", e);
            return Err(e);
        }

        let reaper = spec.is_master().then(|| self.done_tx.clone());
        ctx.start_monitor(reaper);
        ctx.admit();
        info!(
            task_id = %spec.id,
            command = %spec.command,
            pool = %spec.goroutine_pool,
            parent_id = %spec.parent_id,
            "任务已提交"
        );
        Ok(spec)
    }

    fn acquire_slot(&self) -> FleetResult<()> {
        for _ in 0..CAS_RETRIES {
            let current = self.active_count.load(Ordering::SeqCst);
            if current >= self.spec.max_active_tasks {
                return Err(FleetError::TooManyTask);
            }
            if self
                .active_count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(FleetError::TooManyTask)
    }

    fn active_context(&self, id: &str) -> Option<TaskContext> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// 活跃任务返回原上下文，已回收的任务返回只读的历史上下文
    pub async fn get_task_context(&self, id: &str) -> FleetResult<TaskContext> {
        if let Some(ctx) = self.active_context(id) {
            return Ok(ctx);
        }
        let task = self
            .repo
            .get_task(id)
            .await?
            .ok_or_else(|| FleetError::TaskNotFound { id: id.to_string() })?;
        Ok(TaskContext::history(task, self.repo.clone()))
    }

    pub fn new_sub_task_selector(self: &Arc<Self>, master_id: impl Into<String>) -> SubTaskSelector {
        SubTaskSelector::new(master_id.into(), self.clone())
    }

    async fn remove_history_tasks(&self) -> FleetResult<()> {
        let mut masters = self.repo.get_finished_master_tasks().await?;

        for master in &masters {
            if self.active_context(master.id()).is_none() {
                continue;
            }
            let Some(tree) = self.repo.get_task_tree(master.id()).await? else {
                continue;
            };
            if !tree.is_all_finished() {
                continue;
            }
            let mut removed = 0;
            tree.walk(&mut |task| {
                if write_index(&self.active).remove(task.id()).is_some() {
                    removed += 1;
                }
            });
            self.active_count.fetch_sub(removed, Ordering::SeqCst);
            debug!(task_id = %master.id(), removed, "已结束的任务树已移出活跃索引");
        }

        let excess = masters.len() as i64 - self.spec.max_history_master_tasks;
        if excess <= 0 {
            return Ok(());
        }
        masters.sort_by_key(|task| task.status.finished_at);
        let mut deleted = 0;
        for master in &masters {
            if deleted >= excess {
                break;
            }
            if self.active_context(master.id()).is_some() {
                continue;
            }
            let Some(tree) = self.repo.get_task_tree(master.id()).await? else {
                continue;
            };
            if !tree.is_all_finished() {
                continue;
            }
            let mut ids = Vec::new();
            tree.walk(&mut |task| ids.push(task.id().to_string()));
            for id in &ids {
                self.repo.delete_task(id).await?;
            }
            deleted += 1;
        }
        info!("已删除 {} 棵历史任务树", deleted);
        Ok(())
    }
}

fn write_index(active: &ActiveIndex) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TaskContext>> {
    active.write().unwrap_or_else(PoisonError::into_inner)
}

async fn run_reaper(scheduler: Weak<Scheduler>, mut done_rx: mpsc::Receiver<()>, cancel: CancellationToken) {
    loop {
        let Some(current) = scheduler.upgrade() else {
            break;
        };
        if let Err(e) = current.remove_history_tasks().await {
            warn!("回收历史任务失败: {}", e);
        }
        drop(current);

        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = done_rx.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }
    }
    debug!("历史任务回收协程已退出");
}
