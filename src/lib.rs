//! switchboard - 消息路由与进程隔离的 Agent 执行
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、退避策略、优雅关闭
//! - **gateway**: 消息总线、出站路由与远程工具 RPC、Agent 消费循环、调度器、WebSocket / HTTP 接入
//! - **worker**: IPC 协议、Worker 运行时与子进程、Worker 进程池、AgentClient
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod worker;
