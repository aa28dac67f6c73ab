//! Dispatcher - 出站消息路由
//!
//! 两类出站路径：
//! 1. 回复：写入信封的回复槽（HTTP / WebSocket 等待方），并且独立地投递到来源 Channel
//! 2. 主动消息：按 Channel 名或 WebSocket 连接 id 发送（执行 Worker 返回的 PendingPush）
//!
//! 另外维护远程工具 RPC：已连接的 Peer 声明自己能执行的工具，网关按 call_id 关联请求与结果。

use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::bus::Envelope;
use super::message::{DeliveryTarget, OutgoingMessage, ServerFrame, ToolSchema};
use crate::core::RpcError;
use crate::worker::tools::{Tool, ToolContext};
use crate::worker::PendingPush;

/// WebSocket 连接使用的 Channel 名：user_id 即连接 id
pub const WEBSOCKET_CHANNEL: &str = "websocket";

/// Channel 投递接口
///
/// 普通投递失败由实现方自行记录日志，不向 Dispatcher 返回错误。
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, message: OutgoingMessage);
}

struct RemoteTool {
    connection_id: String,
    schema: ToolSchema,
}

struct PendingCall {
    connection_id: String,
    tx: oneshot::Sender<Result<String, RpcError>>,
}

type PendingTable = std::sync::Mutex<HashMap<String, PendingCall>>;

fn lock_pending(pending: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingCall>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// 挂起调用的登记：调用方以任何方式离开（包括被取消）时从表中移除
struct PendingEntry<'a> {
    table: &'a PendingTable,
    call_id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock_pending(self.table).remove(&self.call_id);
    }
}

/// 出站消息路由器
pub struct Dispatcher {
    channels: RwLock<HashMap<String, Arc<dyn ChannelSink>>>,
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<ServerFrame>>>,
    remote_tools: RwLock<HashMap<String, RemoteTool>>,
    pending: PendingTable,
    rpc_timeout: Duration,
}

impl Dispatcher {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            remote_tools: RwLock::new(HashMap::new()),
            pending: std::sync::Mutex::new(HashMap::new()),
            rpc_timeout,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    // ---- Channel 注册表 ----

    pub async fn register_channel(&self, name: impl Into<String>, sink: Arc<dyn ChannelSink>) {
        let name = name.into();
        tracing::info!(channel = %name, "Dispatcher: registered channel");
        self.channels.write().await.insert(name, sink);
    }

    pub async fn unregister_channel(&self, name: &str) -> bool {
        let removed = self.channels.write().await.remove(name).is_some();
        if removed {
            tracing::info!(channel = %name, "Dispatcher: unregistered channel");
        }
        removed
    }

    pub async fn list_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 回复一条入站消息
    ///
    /// 回复槽和来源 Channel 两条路径互不依赖，可能同时生效；空回复不投递到 Channel。
    /// 返回是否至少有一条路径送达。
    pub async fn dispatch_reply(&self, envelope: &mut Envelope, reply: OutgoingMessage) -> bool {
        let mut delivered = false;

        if let Some(slot) = envelope.take_reply() {
            if slot.resolve(reply.clone()) {
                tracing::debug!(envelope = %envelope.short_id(), "Dispatched reply via slot");
                delivered = true;
            } else {
                tracing::debug!(envelope = %envelope.short_id(), "Reply waiter already gone");
            }
        }

        if !reply.is_empty() {
            let message = &envelope.message;
            let sink = self.channels.read().await.get(&message.channel).cloned();
            if let Some(sink) = sink {
                sink.deliver(&message.delivery_target(), reply).await;
                tracing::debug!(channel = %message.channel, user = %message.user_id, "Dispatched reply via channel");
                delivered = true;
            }
        }

        if !delivered {
            tracing::warn!(
                envelope = %envelope.short_id(),
                channel = %envelope.message.channel,
                "No reply path for message"
            );
        }
        delivered
    }

    /// 向指定 Channel 发送消息（Agent 主动发送或回复）
    pub async fn send_to_channel(&self, channel: &str, target: &DeliveryTarget, message: OutgoingMessage) -> bool {
        if channel == WEBSOCKET_CHANNEL {
            return self
                .send_to_connection(&target.user_id, ServerFrame::Push { text: message.text })
                .await;
        }

        let sink = self.channels.read().await.get(channel).cloned();
        match sink {
            Some(sink) => {
                sink.deliver(target, message).await;
                tracing::debug!(channel = %channel, user = %target.user_id, "Dispatched message");
                true
            }
            None => {
                tracing::warn!(channel = %channel, "Dispatcher: no channel registered");
                false
            }
        }
    }

    /// 执行 Worker 返回的推送
    pub async fn send_push(&self, push: &PendingPush) -> bool {
        self.send_to_channel(
            &push.channel,
            &DeliveryTarget::user(push.user_id.clone()),
            OutgoingMessage::text(push.text.clone()),
        )
        .await
    }

    // ---- WebSocket 连接 ----

    pub async fn register_connection(&self, connection_id: impl Into<String>, sender: mpsc::UnboundedSender<ServerFrame>) {
        let connection_id = connection_id.into();
        tracing::debug!(connection = %connection_id, "Dispatcher: registered connection");
        self.connections.write().await.insert(connection_id, sender);
    }

    /// 注销连接：移除它拥有的远程工具，并让它名下所有未完成的调用立即失败
    ///
    /// 返回被失败的调用数。
    pub async fn unregister_connection(&self, connection_id: &str) -> usize {
        self.connections.write().await.remove(connection_id);

        self.remote_tools
            .write()
            .await
            .retain(|_, tool| tool.connection_id != connection_id);

        let failed: Vec<PendingCall> = {
            let mut pending = lock_pending(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, call)| call.connection_id == connection_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for call in failed {
            let _ = call.tx.send(Err(RpcError::ConnectionLost(connection_id.to_string())));
        }

        tracing::debug!(connection = %connection_id, failed_calls = count, "Dispatcher: unregistered connection");
        count
    }

    pub async fn send_to_connection(&self, connection_id: &str, frame: ServerFrame) -> bool {
        let sender = self.connections.read().await.get(connection_id).cloned();
        match sender {
            Some(sender) if sender.send(frame).is_ok() => true,
            Some(_) => {
                tracing::warn!(connection = %connection_id, "Dispatcher: connection closed");
                false
            }
            None => {
                tracing::warn!(connection = %connection_id, "Dispatcher: no WebSocket connection");
                false
            }
        }
    }

    pub async fn list_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ---- 远程工具 RPC ----

    /// 记录某个连接声明的工具（替换该连接之前的声明）；返回工具名
    pub async fn register_remote_tools(&self, connection_id: &str, schemas: Vec<ToolSchema>) -> Vec<String> {
        let mut tools = self.remote_tools.write().await;
        tools.retain(|_, tool| tool.connection_id != connection_id);

        let mut names = Vec::with_capacity(schemas.len());
        for schema in schemas {
            if let Some(previous) = tools.get(&schema.name) {
                tracing::warn!(
                    tool = %schema.name,
                    from = %previous.connection_id,
                    to = %connection_id,
                    "Remote tool re-registered by another connection"
                );
            }
            names.push(schema.name.clone());
            tools.insert(
                schema.name.clone(),
                RemoteTool {
                    connection_id: connection_id.to_string(),
                    schema,
                },
            );
        }
        tracing::info!(connection = %connection_id, tools = ?names, "Registered remote tools");
        names
    }

    /// 当前可用的远程工具 schema（按名排序）
    pub async fn remote_tool_schemas(&self) -> Vec<ToolSchema> {
        let tools = self.remote_tools.read().await;
        let mut schemas: Vec<ToolSchema> = tools.values().map(|t| t.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// 调用远程工具
    ///
    /// 超时或调用方放弃时移除挂起的调用；连接断开时立即失败，不等超时。
    pub async fn call_remote_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<String, RpcError> {
        let connection_id = self
            .remote_tools
            .read()
            .await
            .get(name)
            .map(|tool| tool.connection_id.clone())
            .ok_or_else(|| RpcError::NotRegistered(name.to_string()))?;

        let call_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        // 先登记再查连接：与 unregister_connection 交错时，调用要么被它清掉，要么在这里发现连接已不在
        lock_pending(&self.pending).insert(
            call_id.clone(),
            PendingCall {
                connection_id: connection_id.clone(),
                tx,
            },
        );
        let _entry = PendingEntry {
            table: &self.pending,
            call_id: call_id.clone(),
        };

        let frame = ServerFrame::ToolRequest {
            call_id: call_id.clone(),
            tool_name: name.to_string(),
            arguments,
        };
        if !self.send_to_connection(&connection_id, frame).await {
            return Err(RpcError::ConnectionUnavailable(connection_id));
        }
        tracing::debug!(call = %call_id, tool = %name, connection = %connection_id, "Remote tool requested");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionLost(connection_id)),
            Err(_) => {
                tracing::warn!(call = %call_id, tool = %name, "Remote tool call timed out");
                Err(RpcError::Timeout {
                    tool: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// 同 `call_remote_tool`，失败渲染为结果字符串（工具失败作为数据交给 Agent）
    pub async fn invoke_remote_tool(&self, name: &str, arguments: Value, timeout: Duration) -> String {
        match self.call_remote_tool(name, arguments, timeout).await {
            Ok(result) => result,
            Err(e) => format!("Error: {e}"),
        }
    }

    /// Peer 返回结果时由传输层调用；没有对应的挂起调用（重复或迟到）时只记录警告
    pub async fn resolve_rpc_result(&self, call_id: &str, result: Option<String>, error: Option<String>) -> bool {
        let Some(call) = lock_pending(&self.pending).remove(call_id) else {
            tracing::warn!(call = %call_id, "RPC result for unknown call (duplicate or late)");
            return false;
        };
        let value = match error {
            Some(error) => Err(RpcError::Remote(error)),
            None => Ok(result.unwrap_or_default()),
        };
        if call.tx.send(value).is_err() {
            tracing::debug!(call = %call_id, "RPC caller already gone");
        }
        true
    }

    pub async fn pending_call_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// 嵌入模式下把远程工具暴露给 Agent 的桥接工具
pub struct RemoteToolBridge {
    dispatcher: Arc<Dispatcher>,
}

impl RemoteToolBridge {
    pub const NAME: &'static str = "remote_tool";

    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Tool for RemoteToolBridge {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Call a tool provided by a connected client. Args: tool, arguments"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "tool": {"type": "string"},
                "arguments": {"type": "object"}
            },
            "required": ["tool"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let tool = args
            .get("tool")
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing argument: tool".to_string())?;
        let arguments = args.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));
        self.dispatcher
            .call_remote_tool(tool, arguments, self.dispatcher.rpc_timeout())
            .await
            .map_err(|e| e.to_string())
    }
}
