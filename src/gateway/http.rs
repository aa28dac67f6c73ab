//! HTTP 接入
//!
//! - `POST /chat`：发布到总线并等待回复，上限为 reply_timeout
//! - `GET /health`：存活探测，附带池状态
//! - `GET /agents` / `GET /tools`：可用的 Agent 与工具
//!
//! 配置了 api_key 时，除 `/health` 外都要求 `X-API-Key` 头。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::MessageBus;
use super::dispatcher::Dispatcher;
use super::message::IncomingMessage;
use super::server::ServerSettings;
use crate::worker::AgentClient;

/// HTTP 请求使用的 Channel 名（没有对应的 ChannelSink，回复只走回复槽）
pub const HTTP_CHANNEL: &str = "http";

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

fn default_user_id() -> String {
    "api_user".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub text: String,
    pub session_id: String,
    pub attachments: Vec<String>,
}

struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

struct HttpState {
    settings: ServerSettings,
    bus: Arc<MessageBus>,
    dispatcher: Arc<Dispatcher>,
    client: AgentClient,
}

impl HttpState {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.settings.api_key else {
            return Ok(());
        };
        match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            None => Err(ApiError::new(StatusCode::UNAUTHORIZED, "Missing API Key")),
            Some(key) if key == expected => Ok(()),
            Some(_) => Err(ApiError::new(StatusCode::UNAUTHORIZED, "Invalid API Key")),
        }
    }
}

/// HTTP API 服务
pub struct HttpApi {
    state: Arc<HttpState>,
    shutdown: CancellationToken,
}

impl HttpApi {
    pub fn new(settings: ServerSettings, bus: Arc<MessageBus>, dispatcher: Arc<Dispatcher>, client: AgentClient) -> Self {
        Self {
            state: Arc::new(HttpState {
                settings,
                bus,
                dispatcher,
                client,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/chat", post(chat))
            .route("/health", get(health))
            .route("/agents", get(list_agents))
            .route("/tools", get(list_tools))
            .with_state(Arc::clone(&self.state))
    }

    /// 绑定 `http_bind_addr` 并在后台服务，返回实际监听地址
    pub async fn start(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.state.settings.http_bind_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("HTTP API listening on http://{}", addr);

        let app = self.router();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("HTTP API error: {}", e);
            }
            tracing::info!("HTTP API stopped");
        });
        Ok((addr, handle))
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn chat(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    state.authorize(&headers)?;

    let mut message = IncomingMessage::new(HTTP_CHANNEL, request.user_id, request.text);
    if let Some(session_id) = request.session_id {
        message = message.with_raw("session_id", session_id.into());
    }
    message.images = request.images;
    let session_id = message.session_id();

    let timeout = state.settings.reply_timeout;
    match tokio::time::timeout(timeout, state.bus.publish(message, true)).await {
        Ok(Ok(reply)) => {
            let reply = reply.unwrap_or_default();
            Ok(Json(ChatResponse {
                text: reply.text,
                session_id,
                attachments: reply.attachments,
            }))
        }
        Ok(Err(e)) => {
            tracing::error!(session = %session_id, "Error processing chat: {}", e);
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
        Err(_) => {
            tracing::warn!(session = %session_id, "Reply timed out");
            Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Reply timed out after {:?}", timeout),
            ))
        }
    }
}

async fn health(State(state): State<Arc<HttpState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mode": state.client.mode(),
        "pending_messages": state.bus.pending_count(),
        "pool": state.client.pool_status().await,
    }))
}

async fn list_agents(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    let agents: Vec<Value> = state
        .client
        .catalog()
        .agents
        .into_iter()
        .map(|id| json!({ "id": id }))
        .collect();
    Ok(Json(json!({ "agents": agents })))
}

async fn list_tools(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    let tools: Vec<Value> = state
        .client
        .catalog()
        .tools
        .into_iter()
        .map(|schema| json!({ "name": schema["name"], "description": schema["description"] }))
        .collect();
    let remote_tools: Vec<Value> = state
        .dispatcher
        .remote_tool_schemas()
        .await
        .into_iter()
        .map(|schema| json!({ "name": schema.name, "description": schema.description }))
        .collect();
    Ok(Json(json!({ "tools": tools, "remote_tools": remote_tools })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    use super::*;
    use crate::gateway::agent_loop::{AgentLoop, AgentSettings};
    use crate::worker::AgentRuntime;

    fn settings(api_key: Option<&str>, reply_timeout: Duration) -> ServerSettings {
        ServerSettings {
            bind_addr: "127.0.0.1:0".to_string(),
            http_bind_addr: "127.0.0.1:0".to_string(),
            api_key: api_key.map(str::to_string),
            reply_timeout,
        }
    }

    async fn setup(api_key: Option<&str>) -> (HttpApi, Arc<AgentLoop>) {
        let bus = Arc::new(MessageBus::new());
        let dispatcher = Arc::new(Dispatcher::default());
        let client = AgentClient::embedded(AgentRuntime::builtin());

        let agent_loop = Arc::new(AgentLoop::new(
            Arc::clone(&bus),
            Arc::clone(&dispatcher),
            client.clone(),
            AgentSettings::default(),
        ));
        agent_loop.start();

        let api = HttpApi::new(settings(api_key, Duration::from_secs(5)), bus, dispatcher, client);
        (api, agent_loop)
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_chat(body: Value, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/chat").header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("X-API-Key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(path: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::get(path);
        if let Some(key) = api_key {
            builder = builder.header("X-API-Key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_chat_requires_api_key() {
        let (api, agent_loop) = setup(Some("secret")).await;

        let (status, body) = call(api.router(), post_chat(json!({"text": "hi"}), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["detail"], "Missing API Key");

        let (status, body) = call(api.router(), post_chat(json!({"text": "hi"}), Some("nope"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["detail"], "Invalid API Key");

        let (status, body) = call(api.router(), post_chat(json!({"text": "你好"}), Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "你好");
        assert_eq!(body["session_id"], "http:dm:api_user");
        assert_eq!(body["attachments"], json!([]));

        agent_loop.stop().await;
    }

    #[tokio::test]
    async fn test_chat_keeps_explicit_session() {
        let (api, agent_loop) = setup(None).await;

        let request = post_chat(json!({"text": "第一句", "user_id": "u7", "session_id": "s-42"}), None);
        let (status, body) = call(api.router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], "s-42");

        let history = agent_loop.history().recent("s-42").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "第一句");

        agent_loop.stop().await;
    }

    #[tokio::test]
    async fn test_chat_without_consumer_times_out() {
        let bus = Arc::new(MessageBus::new());
        let client = AgentClient::embedded(AgentRuntime::builtin());
        let api = HttpApi::new(
            settings(None, Duration::from_millis(100)),
            Arc::clone(&bus),
            Arc::new(Dispatcher::default()),
            client,
        );

        let (status, body) = call(api.router(), post_chat(json!({"text": "anyone?"}), None)).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body["detail"].as_str().unwrap().starts_with("Reply timed out"));

        bus.close();
        let (status, _) = call(api.router(), post_chat(json!({"text": "closed"}), None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_and_listings() {
        let (api, agent_loop) = setup(Some("secret")).await;

        let (status, body) = call(api.router(), get_request("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "embedded");
        assert!(body["pool"].is_null());

        let (status, _) = call(api.router(), get_request("/agents", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, body) = call(api.router(), get_request("/agents", Some("secret"))).await;
        assert_eq!(body, json!({"agents": [{"id": "default"}]}));

        let (_, body) = call(api.router(), get_request("/tools", Some("secret"))).await;
        let names: Vec<&str> = body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"send_message"));
        assert_eq!(body["remote_tools"], json!([]));

        agent_loop.stop().await;
    }

    #[tokio::test]
    async fn test_serves_over_tcp_until_stopped() {
        let (api, agent_loop) = setup(None).await;
        let (addr, handle) = api.start().await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));

        api.stop();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        agent_loop.stop().await;
    }
}
