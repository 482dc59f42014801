//! 任务执行器工厂与注册表

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::TaskContext;

/// 单次执行的任务体
pub type ExecutorFuture = BoxFuture<'static, ()>;

/// 按 `command` 注册的执行器工厂，每次执行生成一个新的任务体
pub trait TaskExecutorFactory: Send + Sync {
    fn id(&self) -> &str;

    fn create(&self, ctx: &TaskContext) -> ExecutorFuture;
}

/// 用闭包实现的执行器工厂
pub struct FnExecutorFactory<F> {
    id: String,
    f: F,
}

impl<F, Fut> FnExecutorFactory<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(id: impl Into<String>, f: F) -> Self {
        Self { id: id.into(), f }
    }

    pub fn arc(id: impl Into<String>, f: F) -> Arc<dyn TaskExecutorFactory> {
        Arc::new(Self::new(id, f))
    }
}

impl<F, Fut> TaskExecutorFactory for FnExecutorFactory<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn create(&self, ctx: &TaskContext) -> ExecutorFuture {
        (self.f)(ctx.clone()).boxed()
    }
}

#[derive(Default)]
pub(crate) struct ExecutorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn TaskExecutorFactory>>>,
}

impl ExecutorRegistry {
    /// 已存在同名工厂时保留旧值并返回 false
    pub(crate) fn register(&self, factory: Arc<dyn TaskExecutorFactory>) -> bool {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(factory.id()) {
            return false;
        }
        factories.insert(factory.id().to_string(), factory);
        true
    }

    pub(crate) fn get(&self, command: &str) -> Option<Arc<dyn TaskExecutorFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
    }
}
