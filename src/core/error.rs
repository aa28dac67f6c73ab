//! 各子系统的错误类型
//!
//! 分类：传输（连接丢失、序列化失败）、超时、执行（Agent/工具失败）、生命周期（Worker 崩溃、超出重启预算）。
//! 执行错误在 Worker 内转成 `success:false` 数据，不跨进程抛出；传输与超时错误以类型化错误返回给直接调用方。

use std::time::Duration;

use thiserror::Error;

/// MessageBus 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("MessageBus is closed")]
    Closed,

    /// 消费方丢弃了信封而没有回复
    #[error("Reply slot dropped before it was resolved")]
    ReplyDropped,
}

/// 远程工具 RPC 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Remote tool '{0}' is not registered")]
    NotRegistered(String),

    #[error("Connection '{0}' is not available")]
    ConnectionUnavailable(String),

    #[error("Remote tool '{tool}' timed out after {}s", timeout.as_secs_f64())]
    Timeout { tool: String, timeout: Duration },

    #[error("Connection '{0}' lost")]
    ConnectionLost(String),

    /// Peer 端执行工具时返回的错误
    #[error("Remote tool failed: {0}")]
    Remote(String),
}

/// Worker 管道上的协议错误
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 对端关闭了管道（EOF）
    #[error("Channel closed by peer")]
    Closed,

    #[error("Unexpected frame: {0}")]
    Unexpected(String),
}

/// WorkerPool 错误
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("WorkerPool not started")]
    NotStarted,

    #[error("WorkerPool is shutting down")]
    ShuttingDown,

    /// 所有槽位都已因超出重启预算被移除
    #[error("WorkerPool has no workers left")]
    NoWorkers,

    #[error("Failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {worker_id} response timeout after {}s", timeout.as_secs_f64())]
    Timeout { worker_id: usize, timeout: Duration },

    #[error("Worker {0} connection lost")]
    ConnectionLost(usize),

    #[error("Worker {worker_id} protocol error: {source}")]
    Protocol {
        worker_id: usize,
        #[source]
        source: ProtocolError,
    },

    #[error("Invalid pool config: {0}")]
    InvalidConfig(String),
}

/// 网关侧 Scheduler 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Invalid job '{job_id}': {reason}")]
    InvalidJob { job_id: String, reason: String },

    #[error("Scheduler is shut down")]
    Closed,
}

/// Worker 内执行 Agent 时的错误（最终转成 `AgentResponse.error`）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent '{0}' not found")]
    NotFound(String),

    #[error("Agent execution failed: {0}")]
    Execution(String),

    #[error("Agent panicked: {0}")]
    Panicked(String),
}

/// AgentClient 错误：池错误原样透传，执行失败携带 Worker 返回的错误文本
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Agent error: {0}")]
    Agent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_timeout_message() {
        let err = RpcError::Timeout {
            tool: "read_file".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Remote tool 'read_file' timed out after 5s");
    }

    #[test]
    fn test_pool_timeout_keeps_subsecond_precision() {
        let err = PoolError::Timeout {
            worker_id: 0,
            timeout: Duration::from_millis(100),
        };
        assert_eq!(err.to_string(), "Worker 0 response timeout after 0.1s");
    }

    #[test]
    fn test_client_error_from_pool() {
        let err: ClientError = PoolError::ConnectionLost(3).into();
        assert_eq!(err.to_string(), "Worker 3 connection lost");
    }
}
