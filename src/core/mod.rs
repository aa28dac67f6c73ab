//! 基础设施：错误类型、退避策略、优雅关闭

pub mod backoff;
pub mod error;
pub mod shutdown;

pub use backoff::{Backoff, BackoffPolicy};
pub use error::{AgentError, BusError, ClientError, PoolError, ProtocolError, RpcError, SchedulerError};
pub use shutdown::{
    AgentLoopCleanup, BusCleanup, PoolCleanup, SchedulerCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
