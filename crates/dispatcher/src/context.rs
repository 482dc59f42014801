//! 任务上下文与生命周期监控
//!
//! 每个活跃任务有一个监控协程独占当前阶段：执行器与工作协程的状态更新都通过通道发给它，
//! 由它检查阶段迁移规则、写库并处理等待、心跳、执行与优雅退出四类超时。

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use edgefleet_domain::{
    allow_phase_transition, FleetError, FleetResult, Task, TaskPhase, TaskRepository, TaskSpec, TaskStatus,
    TaskStatusUpdate, TaskTreeNode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, warn};

/// 状态更新请求的发送与应答超时
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);
const UPDATE_BUFFER: usize = 16;

/// 强制迁移时记录的原因
pub mod reason {
    pub const WAIT_TIMEOUT: &str = "wait timeout";
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat timeout";
    pub const EXECUTE_TIMEOUT: &str = "execute timeout";
    pub const GRACEFUL_SHUTDOWN_TIMEOUT: &str = "graceful shutdown timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const FACTORY_NOT_FOUND: &str = "factory not found";
    pub const EXECUTOR_PANICKED: &str = "executor panicked";
    pub const INTERRUPTED: &str = "interrupted";
}

struct StatusRequest {
    update: TaskStatusUpdate,
    by_user: bool,
    reply: oneshot::Sender<FleetResult<Task>>,
}

/// 提交事务的结果，工作协程在事务提交后才开始处理任务
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pending,
    Admitted,
    Rejected,
}

struct MonitorChannels {
    updates: mpsc::Receiver<StatusRequest>,
    heartbeats: mpsc::Receiver<()>,
}

struct Inner {
    spec: TaskSpec,
    repo: Arc<dyn TaskRepository>,
    cancel: CancellationToken,
    graceful: CancellationToken,
    done: CancellationToken,
    updates: mpsc::Sender<StatusRequest>,
    heartbeats: mpsc::Sender<()>,
    monitor: Mutex<Option<MonitorChannels>>,
    admission: watch::Sender<Admission>,
}

/// 任务上下文，克隆后共享同一个任务
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<Inner>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.inner.spec.id)
            .field("command", &self.inner.spec.command)
            .field("done", &self.is_done())
            .finish()
    }
}

impl TaskContext {
    /// `parent` 为父任务的主取消令牌，主任务使用调度器的令牌
    pub(crate) fn new(spec: TaskSpec, parent: &CancellationToken, repo: Arc<dyn TaskRepository>) -> Self {
        let (updates, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let (heartbeats, heartbeats_rx) = mpsc::channel(1);
        let (admission, _) = watch::channel(Admission::Pending);
        Self {
            inner: Arc::new(Inner {
                spec,
                repo,
                cancel: parent.child_token(),
                graceful: CancellationToken::new(),
                done: CancellationToken::new(),
                updates,
                heartbeats,
                monitor: Mutex::new(Some(MonitorChannels {
                    updates: updates_rx,
                    heartbeats: heartbeats_rx,
                })),
                admission,
            }),
        }
    }

    /// 已不在活跃索引中的任务，只能读取，状态更新一律返回 `TaskAlreadyFinished`
    pub(crate) fn history(task: Task, repo: Arc<dyn TaskRepository>) -> Self {
        let ctx = Self::new(task.spec, &CancellationToken::new(), repo);
        ctx.monitor_channels();
        ctx.destroy();
        ctx
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.inner.spec
    }

    pub fn id(&self) -> &str {
        &self.inner.spec.id
    }

    /// 执行器发起的状态更新
    pub async fn update_status(&self, update: TaskStatusUpdate) -> FleetResult<()> {
        self.request(update, true).await.map(|_| ())
    }

    /// 超时、取消与工作协程发起的状态更新，可以推进到更高权重的阶段
    pub(crate) async fn system_update(&self, update: TaskStatusUpdate) -> FleetResult<Task> {
        self.request(update, false).await
    }

    pub(crate) async fn force_fail(&self, reason: &str) {
        let update = TaskStatusUpdate::phase(TaskPhase::Failed).with_reason(reason);
        match self.system_update(update).await {
            Ok(_) => warn!(task_id = %self.id(), reason, "任务被置为失败"),
            Err(e) => warn!(task_id = %self.id(), reason, "置任务失败状态未成功: {}", e),
        }
    }

    async fn request(&self, update: TaskStatusUpdate, by_user: bool) -> FleetResult<Task> {
        let (reply, response) = oneshot::channel();
        let request = StatusRequest { update, by_user, reply };
        match timeout(UPDATE_TIMEOUT, self.inner.updates.send(request)).await {
            Err(_) => return Err(FleetError::Timeout),
            Ok(Err(_)) => return Err(FleetError::TaskAlreadyFinished),
            Ok(Ok(())) => {}
        }
        match timeout(UPDATE_TIMEOUT, response).await {
            Err(_) => Err(FleetError::Timeout),
            Ok(Err(_)) => Err(FleetError::TaskAlreadyFinished),
            Ok(Ok(result)) => result,
        }
    }

    /// 心跳，不阻塞
    pub fn update_liveness(&self) {
        let _ = self.inner.heartbeats.try_send(());
    }

    pub async fn get_status(&self) -> FleetResult<TaskStatus> {
        self.inner
            .repo
            .get_task(self.id())
            .await?
            .map(|task| task.status)
            .ok_or_else(|| FleetError::TaskNotFound { id: self.id().to_string() })
    }

    pub async fn get_sub_task_tree(&self) -> FleetResult<TaskTreeNode> {
        self.inner
            .repo
            .get_task_tree(self.id())
            .await?
            .ok_or_else(|| FleetError::TaskNotFound { id: self.id().to_string() })
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// 进入 Aborting 阶段时取消，执行器据此开始收尾
    pub fn graceful_shutdown(&self) -> CancellationToken {
        self.inner.graceful.clone()
    }

    /// 任务主令牌，子任务的令牌由它派生
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// 任务进入结束阶段且监控协程退出后完成
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.done.clone().cancelled_owned()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    pub(crate) fn admit(&self) {
        self.inner.admission.send_replace(Admission::Admitted);
    }

    /// 提交失败时销毁上下文
    pub(crate) fn destroy(&self) {
        self.inner.admission.send_replace(Admission::Rejected);
        self.inner.cancel.cancel();
        self.inner.done.cancel();
    }

    pub(crate) async fn wait_admitted(&self) -> bool {
        let mut admission = self.inner.admission.subscribe();
        let admitted = match admission.wait_for(|state| *state != Admission::Pending).await {
            Ok(state) => *state == Admission::Admitted,
            Err(_) => false,
        };
        admitted
    }

    fn monitor_channels(&self) -> Option<MonitorChannels> {
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// 启动生命周期监控，只有第一次调用生效。主任务结束时向 `reaper` 发信号
    pub(crate) fn start_monitor(&self, reaper: Option<mpsc::Sender<()>>) {
        let Some(channels) = self.monitor_channels() else {
            return;
        };
        let monitor = Monitor {
            ctx: self.clone(),
            phase: TaskPhase::Waiting,
        };
        tokio::spawn(monitor.run(channels, reaper));
    }
}

fn deadline_after(duration: Duration) -> Option<Instant> {
    (!duration.is_zero()).then(|| Instant::now() + duration)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Monitor {
    ctx: TaskContext,
    phase: TaskPhase,
}

impl Monitor {
    async fn run(mut self, channels: MonitorChannels, reaper: Option<mpsc::Sender<()>>) {
        let MonitorChannels {
            mut updates,
            mut heartbeats,
        } = channels;
        debug!(task_id = %self.ctx.id(), "开始监控任务生命周期");

        if self.phase == TaskPhase::Waiting {
            self.on_waiting(&mut updates).await;
        }
        if self.phase == TaskPhase::Processing {
            self.on_processing(&mut updates, &mut heartbeats).await;
        }
        self.ctx.inner.cancel.cancel();
        if self.phase == TaskPhase::Aborting {
            self.on_aborting(&mut updates).await;
        }

        updates.close();
        while let Ok(request) = updates.try_recv() {
            let _ = request.reply.send(Err(FleetError::TaskAlreadyFinished));
        }
        self.ctx.inner.done.cancel();
        if let Some(reaper) = reaper {
            let _ = reaper.try_send(());
        }
        info!(task_id = %self.ctx.id(), phase = %self.phase, "任务已结束");
    }

    async fn on_waiting(&mut self, updates: &mut mpsc::Receiver<StatusRequest>) {
        let deadline = deadline_after(self.ctx.spec().wait_timeout);
        let cancel = self.ctx.inner.cancel.clone();
        while self.phase == TaskPhase::Waiting {
            tokio::select! {
                Some(request) = updates.recv() => {
                    self.handle(request).await;
                }
                _ = wait_until(deadline) => self.force(TaskPhase::Failed, reason::WAIT_TIMEOUT).await,
                _ = cancel.cancelled() => self.force(TaskPhase::Failed, reason::CANCELLED).await,
            }
        }
    }

    async fn on_processing(
        &mut self,
        updates: &mut mpsc::Receiver<StatusRequest>,
        heartbeats: &mut mpsc::Receiver<()>,
    ) {
        let heartbeat_timeout = self.ctx.spec().heartbeat_timeout;
        let execute_deadline = deadline_after(self.ctx.spec().execute_timeout);
        let mut heartbeat_deadline = deadline_after(heartbeat_timeout);
        let cancel = self.ctx.inner.cancel.clone();
        while self.phase == TaskPhase::Processing {
            tokio::select! {
                Some(request) = updates.recv() => {
                    if self.handle(request).await {
                        heartbeat_deadline = deadline_after(heartbeat_timeout);
                    }
                }
                Some(()) = heartbeats.recv() => heartbeat_deadline = deadline_after(heartbeat_timeout),
                _ = wait_until(heartbeat_deadline) => {
                    self.force(TaskPhase::Aborting, reason::HEARTBEAT_TIMEOUT).await
                }
                _ = wait_until(execute_deadline) => {
                    self.force(TaskPhase::Aborting, reason::EXECUTE_TIMEOUT).await
                }
                _ = cancel.cancelled() => self.force(TaskPhase::Aborting, reason::CANCELLED).await,
            }
        }
    }

    async fn on_aborting(&mut self, updates: &mut mpsc::Receiver<StatusRequest>) {
        let grace = self.ctx.spec().graceful_shutdown_timeout;
        if grace.is_zero() {
            self.force(TaskPhase::Failed, reason::GRACEFUL_SHUTDOWN_TIMEOUT).await;
            return;
        }
        self.ctx.inner.graceful.cancel();
        let deadline = Instant::now() + grace;
        while self.phase == TaskPhase::Aborting {
            tokio::select! {
                Some(request) = updates.recv() => {
                    self.handle(request).await;
                }
                _ = sleep_until(deadline) => {
                    self.force(TaskPhase::Failed, reason::GRACEFUL_SHUTDOWN_TIMEOUT).await
                }
            }
        }
    }

    /// 处理一个更新请求，返回是否为成功的执行器更新
    async fn handle(&mut self, request: StatusRequest) -> bool {
        let by_user = request.by_user;
        let result = self.transition(request.update, by_user).await;
        let accepted = result.is_ok();
        let _ = request.reply.send(result);
        by_user && accepted
    }

    async fn transition(&mut self, update: TaskStatusUpdate, by_user: bool) -> FleetResult<Task> {
        if !allow_phase_transition(self.phase, update.phase, by_user) {
            return Err(FleetError::TaskAlreadyFinished);
        }
        let (task, rows) = self
            .ctx
            .inner
            .repo
            .update_task_status(self.ctx.id(), &update)
            .await?;
        if rows == 0 {
            if task.status.phase.is_finished() {
                self.phase = task.status.phase;
            }
            return Err(FleetError::NoRowsAffected);
        }
        self.phase = task.status.phase;
        Ok(task)
    }

    /// 写库失败时本地按失败处理，遗留的库内状态在下次启动时统一置为失败
    async fn force(&mut self, target: TaskPhase, reason: &str) {
        let update = TaskStatusUpdate::phase(target).with_reason(reason);
        match self.transition(update, false).await {
            Ok(_) => warn!(task_id = %self.ctx.id(), reason, "任务被强制迁移到 {}", target),
            Err(e) => {
                error!(task_id = %self.ctx.id(), reason, "强制迁移任务到 {} 失败: {}", target, e);
                if !self.phase.is_finished() {
                    self.phase = TaskPhase::Failed;
                }
            }
        }
    }
}
