//! 网关与 Worker 进程之间的通信协议
//!
//! 每条消息是一行 JSON（`serde_json` 紧凑输出不含裸换行，天然自定界），通过 Worker 的 stdin/stdout 传输。
//! 控制消息（SHUTDOWN / HEALTH_CHECK / HEALTH_OK）用帧的 `kind` 字段区分，和用户数据不在同一层，不会冲突。

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::ProtocolError;

/// 待执行的推送
///
/// Worker 里的工具拿不到 Channel 连接，只能描述推送，由网关进程执行。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPush {
    pub channel: String,
    pub user_id: String,
    pub text: String,
}

/// 定时任务触发方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "lowercase")]
pub enum Trigger {
    /// 指定时间触发一次
    Date { run_date: DateTime<Utc> },
    /// 固定间隔重复触发
    Interval { seconds: u64 },
}

/// Scheduler 变更描述，由网关在主进程中执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SchedulerOp {
    Add {
        job_id: String,
        #[serde(flatten)]
        trigger: Trigger,
        #[serde(default)]
        kwargs: Map<String, Value>,
        #[serde(default)]
        replace_existing: bool,
    },
    Remove {
        job_id: String,
    },
}

impl SchedulerOp {
    pub fn job_id(&self) -> &str {
        match self {
            SchedulerOp::Add { job_id, .. } | SchedulerOp::Remove { job_id } => job_id,
        }
    }
}

/// 一条历史对话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// 消息上下文（世界信息）：谁、在哪个 Channel、什么时间
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageContext {
    pub user_id: String,
    pub channel: String,
    pub session_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_group: bool,
    pub group_id: Option<String>,
    pub is_owner: bool,
    pub available_channels: Vec<String>,
    pub attachments: Vec<String>,
    /// 限制 Agent 工具循环的迭代次数（周期唤醒时使用）
    pub max_iterations: Option<u32>,
    pub raw: Map<String, Value>,
}

/// 发给 Worker 的请求：执行一次 Agent 所需的全部信息，只有值没有引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub id: String,
    pub agent_id: String,
    pub user_text: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub memories: Vec<String>,
    /// 只传工具名，Worker 在自己的注册表里解析
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub msg_context: MessageContext,
}

impl AgentRequest {
    pub fn new(agent_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            user_text: user_text.into(),
            history: Vec::new(),
            memories: Vec::new(),
            tool_names: Vec::new(),
            images: Vec::new(),
            msg_context: MessageContext::default(),
        }
    }
}

/// Worker 返回的响应：文本结果 + 需要网关代为执行的副作用
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub pending_pushes: Vec<PendingPush>,
    #[serde(default)]
    pub pending_scheduler_ops: Vec<SchedulerOp>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// 网关 → Worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParentFrame {
    Request(AgentRequest),
    Shutdown,
    HealthCheck,
}

/// Worker → 网关
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFrame {
    Response(AgentResponse),
    HealthOk,
}

/// 按行读取帧
///
/// 基于 `read_until`：读到一半被取消（外层超时）时，已读字节留在 `buf` 里，下次调用接着读完该行。
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    consumed: bool,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            consumed: true,
        }
    }

    /// 读取下一行原始文本；EOF 返回 `ProtocolError::Closed`，空行跳过
    pub async fn read_line(&mut self) -> Result<&str, ProtocolError> {
        loop {
            if self.consumed {
                self.buf.clear();
                self.consumed = false;
            }
            let n = self.inner.read_until(b'\n', &mut self.buf).await?;
            if n == 0 && self.buf.is_empty() {
                return Err(ProtocolError::Closed);
            }
            self.consumed = true;
            if !self.buf.iter().all(u8::is_ascii_whitespace) {
                let line = std::str::from_utf8(&self.buf)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                return Ok(line.trim_end());
            }
        }
    }

    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        let line = self.read_line().await?;
        Ok(serde_json::from_str(line)?)
    }
}

/// 按行写入帧
///
/// 写到一半被取消时对端会留下半行；下一帧先补一个换行，让半行自成一条坏帧被对端丢弃。
pub struct FrameWriter<W> {
    inner: W,
    dirty: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, dirty: false }
    }

    pub async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(frame)?;
        let mut line = String::with_capacity(json.len() + 2);
        if self.dirty {
            line.push('\n');
        }
        line.push_str(&json);
        line.push('\n');

        self.dirty = true;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        self.dirty = false;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
