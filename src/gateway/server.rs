//! WebSocket 接入服务
//!
//! Peer 通过 JSON 帧聊天并声明远程工具。聊天消息发布到总线并等待回复；
//! `tool_result` 帧交给 Dispatcher 按 call_id 关联。连接断开时注销其工具并让挂起的调用立即失败。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::bus::MessageBus;
use super::dispatcher::{Dispatcher, WEBSOCKET_CHANNEL};
use super::message::{ClientFrame, IncomingMessage, ServerFrame};
use crate::worker::AgentClient;

/// 服务配置
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// WebSocket 监听地址
    pub bind_addr: String,
    /// HTTP API 监听地址
    pub http_bind_addr: String,
    /// 为 None 时任意 key 都能通过认证
    pub api_key: Option<String>,
    /// 等待总线回复的上限
    pub reply_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            http_bind_addr: "127.0.0.1:9001".to_string(),
            api_key: None,
            reply_timeout: Duration::from_secs(130),
        }
    }
}

struct ServerShared {
    settings: ServerSettings,
    bus: Arc<MessageBus>,
    dispatcher: Arc<Dispatcher>,
    client: AgentClient,
    shutdown: CancellationToken,
}

/// WebSocket 网关服务
pub struct GatewayServer {
    shared: Arc<ServerShared>,
}

impl GatewayServer {
    pub fn new(settings: ServerSettings, bus: Arc<MessageBus>, dispatcher: Arc<Dispatcher>, client: AgentClient) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                settings,
                bus,
                dispatcher,
                client,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 绑定地址并在后台接受连接，返回实际监听地址
    pub async fn start(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.shared.settings.bind_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Gateway listening on ws://{}", addr);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            let shared = Arc::clone(&shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, shared).await {
                                    tracing::error!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept error: {}", e),
                    },
                }
            }
            tracing::info!("Gateway stopped accepting connections");
        });
        Ok((addr, handle))
    }

    /// 停止接受新连接并关闭现有连接
    pub fn stop(&self) {
        self.shared.shutdown.cancel();
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<ServerShared>) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let connection_id = format!("ws_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
    let mut authenticated = false;

    tracing::info!(connection = %connection_id, "New WebSocket connection from {}", peer);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
            None => break,
        };

        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = tx.send(ServerFrame::error(format!("Invalid frame: {e}")));
                continue;
            }
        };

        if let ClientFrame::Auth { api_key } = frame {
            if let Some(expected) = &shared.settings.api_key {
                if api_key.as_deref() != Some(expected.as_str()) {
                    tracing::warn!(connection = %connection_id, "Authentication failed");
                    let _ = tx.send(ServerFrame::error("Invalid api key"));
                    break;
                }
            }
            if !authenticated {
                authenticated = true;
                shared.dispatcher.register_connection(&connection_id, tx.clone()).await;
            }
            let _ = tx.send(ServerFrame::AuthOk {
                connection_id: connection_id.clone(),
            });
            continue;
        }

        if !authenticated {
            let _ = tx.send(ServerFrame::error("Please authenticate first"));
            continue;
        }

        match frame {
            ClientFrame::Message {
                text,
                user_id,
                session_id,
                images,
            } => {
                let mut message =
                    IncomingMessage::new(WEBSOCKET_CHANNEL, user_id.unwrap_or_else(|| connection_id.clone()), text)
                        .with_raw("connection_id", connection_id.clone().into());
                if let Some(session_id) = session_id {
                    message = message.with_raw("session_id", session_id.into());
                }
                message.images = images;

                // 等待回复期间继续读取 tool_result
                let shared = Arc::clone(&shared);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(publish_and_wait(&shared, message).await);
                });
            }
            ClientFrame::RegisterTools { tools } => {
                let names = shared.dispatcher.register_remote_tools(&connection_id, tools).await;
                let _ = tx.send(ServerFrame::ToolsRegistered {
                    count: names.len(),
                    names,
                });
            }
            ClientFrame::ToolResult { call_id, result, error } => {
                shared.dispatcher.resolve_rpc_result(&call_id, result, error).await;
            }
            ClientFrame::Status => {
                let _ = tx.send(ServerFrame::Status {
                    status: status_json(&shared).await,
                });
            }
            ClientFrame::Ping { timestamp } => {
                let _ = tx.send(ServerFrame::Pong { timestamp });
            }
            ClientFrame::Auth { .. } => {}
        }
    }

    if authenticated {
        shared.dispatcher.unregister_connection(&connection_id).await;
    }
    drop(tx);
    let _ = writer.await;

    tracing::info!(connection = %connection_id, "WebSocket connection closed: {}", peer);
    Ok(())
}

async fn publish_and_wait(shared: &ServerShared, message: IncomingMessage) -> ServerFrame {
    let session_id = message.session_id();
    match tokio::time::timeout(shared.settings.reply_timeout, shared.bus.publish(message, true)).await {
        Ok(Ok(Some(reply))) => ServerFrame::Reply {
            text: reply.text,
            session_id,
            attachments: reply.attachments,
        },
        Ok(Ok(None)) => ServerFrame::error("No reply"),
        Ok(Err(e)) => ServerFrame::error(e.to_string()),
        Err(_) => {
            tracing::warn!(session = %session_id, "Reply timed out");
            ServerFrame::error(format!("Reply timed out after {:?}", shared.settings.reply_timeout))
        }
    }
}

async fn status_json(shared: &ServerShared) -> serde_json::Value {
    let remote_tools: Vec<String> = shared
        .dispatcher
        .remote_tool_schemas()
        .await
        .into_iter()
        .map(|schema| schema.name)
        .collect();
    serde_json::json!({
        "mode": shared.client.mode(),
        "pending_messages": shared.bus.pending_count(),
        "channels": shared.dispatcher.list_channels().await,
        "connections": shared.dispatcher.list_connections().await,
        "remote_tools": remote_tools,
        "pending_calls": shared.dispatcher.pending_call_count().await,
        "pool": shared.client.pool_status().await,
    })
}
