//! 网关：消息进出与路由
//!
//! - **message**: 统一的入站 / 出站消息与 WebSocket 帧
//! - **bus**: 入站消息总线（可选回复槽）
//! - **dispatcher**: 出站路由、WebSocket 连接表、远程工具 RPC
//! - **agent_loop**: 总线消费者，调用 Agent 并执行副作用
//! - **scheduler**: 父进程持有的定时任务
//! - **server**: WebSocket 接入（`gateway` feature）
//! - **http**: HTTP 接入，`POST /chat` 与只读查询（`gateway` feature）

pub mod agent_loop;
pub mod bus;
pub mod dispatcher;
pub mod message;
pub mod scheduler;
#[cfg(feature = "gateway")]
pub mod http;
#[cfg(feature = "gateway")]
pub mod server;

pub use agent_loop::{AgentLoop, AgentSettings, SessionHistory, NO_REPLY, SYSTEM_CHANNEL};
pub use bus::{Envelope, MessageBus, ReplySlot};
pub use dispatcher::{ChannelSink, Dispatcher, RemoteToolBridge, WEBSOCKET_CHANNEL};
pub use message::{ClientFrame, DeliveryTarget, IncomingMessage, OutgoingMessage, ServerFrame, ToolSchema};
pub use scheduler::{LocalScheduler, Scheduler};
#[cfg(feature = "gateway")]
pub use http::{ChatRequest, ChatResponse, HttpApi, HTTP_CHANNEL};
#[cfg(feature = "gateway")]
pub use server::{GatewayServer, ServerSettings};
