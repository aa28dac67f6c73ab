//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后按注册顺序执行清理：
//! 先停止接入和消费，再关闭总线和调度器，最后关闭 Worker 进程池。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::gateway::{AgentLoop, LocalScheduler, MessageBus};
use crate::worker::WorkerPool;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 服务自身退出（如监听失败）
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每个任务单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.cleanup_tasks.iter().map(|task| task.name()).collect()
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout),
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 停止消费并等待处理中的消息
pub struct AgentLoopCleanup(pub Arc<AgentLoop>);

#[async_trait::async_trait]
impl ShutdownCleanup for AgentLoopCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.stop().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AgentLoop"
    }
}

/// 关闭总线；之后的 publish 返回 Closed
pub struct BusCleanup(pub Arc<MessageBus>);

#[async_trait::async_trait]
impl ShutdownCleanup for BusCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let dropped = self.0.pending_count();
        self.0.close();
        if dropped > 0 {
            tracing::warn!(dropped, "Bus closed with undelivered messages");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MessageBus"
    }
}

pub struct SchedulerCleanup(pub LocalScheduler);

#[async_trait::async_trait]
impl ShutdownCleanup for SchedulerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Scheduler"
    }
}

/// 向 Worker 发送 SHUTDOWN，超时后强制终止
pub struct PoolCleanup(pub Arc<WorkerPool>);

#[async_trait::async_trait]
impl ShutdownCleanup for PoolCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.0.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WorkerPool"
    }
}
