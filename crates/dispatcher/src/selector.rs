//! 子任务选择器：按结束顺序逐个返回主任务的子任务

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use edgefleet_domain::{FleetError, FleetResult};
use futures::future::{select_all, BoxFuture};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::context::TaskContext;
use crate::scheduler::Scheduler;

enum Selected {
    Cancelled,
    Done(usize),
}

pub struct SubTaskSelector {
    master_id: String,
    scheduler: Arc<Scheduler>,
    returned: Mutex<HashSet<String>>,
}

impl SubTaskSelector {
    pub(crate) fn new(master_id: String, scheduler: Arc<Scheduler>) -> Self {
        Self {
            master_id,
            scheduler,
            returned: Mutex::new(HashSet::new()),
        }
    }

    pub fn master_id(&self) -> &str {
        &self.master_id
    }

    /// 等待下一个结束的子任务，每个子任务只返回一次
    ///
    /// 任一 `cancels` 被取消时返回 `Cancelled`，子任务全部返回过后返回 `NoRunningSubTask`。
    pub async fn select(&self, cancels: &[CancellationToken]) -> FleetResult<TaskContext> {
        loop {
            let tree = self
                .scheduler
                .repo()
                .get_task_tree(&self.master_id)
                .await?
                .ok_or_else(|| FleetError::TaskNotFound {
                    id: self.master_id.clone(),
                })?;

            let pending: Vec<String> = {
                let returned = self.returned.lock().unwrap_or_else(PoisonError::into_inner);
                tree.children
                    .iter()
                    .map(|child| child.current.id().to_string())
                    .filter(|id| !returned.contains(id))
                    .collect()
            };
            if pending.is_empty() {
                return Err(FleetError::NoRunningSubTask);
            }
            let mut contexts = Vec::with_capacity(pending.len());
            for id in &pending {
                contexts.push(self.scheduler.get_task_context(id).await?);
            }

            let mut waits: Vec<BoxFuture<'static, Selected>> = cancels
                .iter()
                .map(|token| token.clone().cancelled_owned().map(|_| Selected::Cancelled).boxed())
                .collect();
            waits.extend(
                contexts
                    .iter()
                    .enumerate()
                    .map(|(index, ctx)| ctx.done().map(move |_| Selected::Done(index)).boxed()),
            );

            let (selected, _, _) = select_all(waits).await;
            match selected {
                Selected::Cancelled => return Err(FleetError::Cancelled),
                Selected::Done(index) => {
                    let ctx = contexts.swap_remove(index);
                    // 并发调用可能已经返回过这个子任务，重新等待剩余的子任务
                    let first_time = self
                        .returned
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(ctx.id().to_string());
                    if first_time {
                        return Ok(ctx);
                    }
                }
            }
        }
    }
}
