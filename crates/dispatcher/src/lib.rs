//! 持久化的层级任务调度
//!
//! 任务按 `goroutine_pool` 进入对应协程池，按 `command` 找到执行器工厂执行。
//! 任务状态保存在 SQLite 中，进程重启后遗留的未结束任务统一置为失败。

pub mod context;
pub mod executor;
mod pool;
pub mod scheduler;
pub mod selector;

pub use context::{reason, TaskContext, UPDATE_TIMEOUT};
pub use executor::{ExecutorFuture, FnExecutorFactory, TaskExecutorFactory};
pub use scheduler::{Scheduler, SchedulerSpec};
pub use selector::SubTaskSelector;
