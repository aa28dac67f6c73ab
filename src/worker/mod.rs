//! 进程隔离的 Agent 执行
//!
//! - **protocol**: 网关与 Worker 之间的请求 / 响应 / 控制帧
//! - **tools**: Worker 本地工具注册表与副作用收集
//! - **runtime**: Worker 本地 Agent 运行时
//! - **process**: Worker 子进程主循环
//! - **pool**: Worker 进程池（可用队列、健康监控、重启）
//! - **client**: 网关侧统一调用入口（嵌入 / 进程池）

pub mod client;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod runtime;
pub mod tools;

pub use client::{AgentClient, AgentRunResult, Catalog, RunInput};
pub use pool::{PoolSettings, PoolStatus, SlotState, WorkerCommand, WorkerPool, WorkerStatus, WORKER_ID_ENV};
pub use process::run_worker;
pub use protocol::{
    AgentRequest, AgentResponse, HistoryEntry, MessageContext, ParentFrame, PendingPush, SchedulerOp, Trigger,
    WorkerFrame,
};
pub use runtime::{Agent, AgentRuntime, EchoAgent, DEFAULT_AGENT};
pub use tools::{Tool, ToolContext, ToolRegistry};
