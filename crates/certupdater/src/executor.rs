//! 以调度任务的形式运行证书轮换

use std::collections::HashMap;
use std::sync::Arc;

use edgefleet_dispatcher::{ExecutorFuture, TaskContext, TaskExecutorFactory};
use edgefleet_domain::{CertKind, FleetError, FleetResult, TaskPhase, TaskStatusUpdate};
use futures::FutureExt;
use tracing::{error, info};

use crate::payload::CertUpdatePayload;
use crate::updater::{CertUpdater, StartOutcome, StopReason};

pub const CERT_UPDATE_COMMAND: &str = "cert-update";

/// `cert-update` 命令的执行器工厂
///
/// 任务参数就是轮换载荷的 JSON 形式，另可带 `"force": true`。
pub struct CertUpdateExecutorFactory {
    updaters: HashMap<CertKind, Arc<CertUpdater>>,
}

impl CertUpdateExecutorFactory {
    pub fn new(updaters: impl IntoIterator<Item = Arc<CertUpdater>>) -> Self {
        Self {
            updaters: updaters.into_iter().map(|u| (u.kind(), u)).collect(),
        }
    }

    pub fn updater(&self, kind: CertKind) -> Option<Arc<CertUpdater>> {
        self.updaters.get(&kind).cloned()
    }

    fn decode(&self, ctx: &TaskContext) -> FleetResult<(Arc<CertUpdater>, CertUpdatePayload)> {
        let args = &ctx.spec().args;
        let mut payload: CertUpdatePayload =
            serde_json::from_value(serde_json::Value::Object(args.clone()))?;
        payload.force = args.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
        let kind = payload.kind()?;
        let updater = self
            .updater(kind)
            .ok_or_else(|| FleetError::CertUpdate(format!("未配置 {kind} 证书轮换")))?;
        Ok((updater, payload))
    }
}

impl TaskExecutorFactory for CertUpdateExecutorFactory {
    fn id(&self) -> &str {
        CERT_UPDATE_COMMAND
    }

    fn create(&self, ctx: &TaskContext) -> ExecutorFuture {
        let ctx = ctx.clone();
        let decoded = self.decode(&ctx);
        async move {
            let update = match decoded {
                Ok((updater, payload)) => run(&updater, payload).await,
                Err(e) => TaskStatusUpdate::phase(TaskPhase::Failed).with_message(e.to_string()),
            };
            if let Err(e) = ctx.update_status(update).await {
                error!(task_id = %ctx.id(), "更新证书轮换任务状态失败: {}", e);
            }
        }
        .boxed()
    }
}

async fn run(updater: &Arc<CertUpdater>, payload: CertUpdatePayload) -> TaskStatusUpdate {
    let handle = match updater.start_update(payload) {
        Ok(StartOutcome::Started(handle)) => handle,
        Ok(StartOutcome::Forwarded) => {
            return TaskStatusUpdate::phase(TaskPhase::Succeeded)
                .with_progress(100)
                .with_message("强制更新已转交给正在运行的轮换");
        }
        Err(e) => return TaskStatusUpdate::phase(TaskPhase::Failed).with_message(e.to_string()),
    };

    match handle.await {
        Ok(summary) => {
            info!(kind = %summary.kind, reason = ?summary.reason, "证书轮换任务结束");
            match summary.reason {
                StopReason::Completed => TaskStatusUpdate::phase(TaskPhase::Succeeded)
                    .with_progress(100)
                    .with_message("全部节点更新成功"),
                StopReason::Forced(_) => TaskStatusUpdate::phase(TaskPhase::Succeeded)
                    .with_progress(100)
                    .with_message("被强制更新结束"),
                StopReason::Aborted(reason) => {
                    TaskStatusUpdate::phase(TaskPhase::Failed).with_message(reason)
                }
            }
        }
        Err(e) => TaskStatusUpdate::phase(TaskPhase::Failed).with_message(format!("证书轮换异常退出: {e}")),
    }
}
