//! 网关消息定义
//!
//! - `IncomingMessage` / `OutgoingMessage`：所有 Channel 统一的入站 / 出站格式
//! - `DeliveryTarget`：从入站消息重建的投递目标
//! - `ClientFrame` / `ServerFrame`：WebSocket Peer 协议（聊天 + 远程工具 RPC）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 入站消息（所有 Channel 统一格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// 来源 Channel，如 "telegram"、"websocket"、"system"
    pub channel: String,
    /// 用户唯一标识
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// 附件路径
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    /// Channel 原始字段（用于回投时重建目标）
    #[serde(default)]
    pub raw: Map<String, Value>,
    /// 群聊未 @ 等场景为 false：记录但不调用 Agent
    #[serde(default = "default_reply_expected")]
    pub reply_expected: bool,
}

fn default_reply_expected() -> bool {
    true
}

impl IncomingMessage {
    pub fn new(channel: impl Into<String>, user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            user_id: user_id.into(),
            text: text.into(),
            is_group: false,
            group_id: None,
            timestamp: Utc::now(),
            attachments: Vec::new(),
            images: Vec::new(),
            raw: Map::new(),
            reply_expected: true,
        }
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.is_group = true;
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_raw(mut self, key: impl Into<String>, value: Value) -> Self {
        self.raw.insert(key.into(), value);
        self
    }

    /// 会话 Key；raw 中显式给出 session_id 时优先使用
    pub fn session_id(&self) -> String {
        if let Some(Value::String(sid)) = self.raw.get("session_id") {
            return sid.clone();
        }
        match (&self.is_group, &self.group_id) {
            (true, Some(group)) => format!("{}:group:{}:user:{}", self.channel, group, self.user_id),
            _ => format!("{}:dm:{}", self.channel, self.user_id),
        }
    }

    /// 回投目标（deliver 函数的第一个参数）
    pub fn delivery_target(&self) -> DeliveryTarget {
        DeliveryTarget {
            user_id: self.user_id.clone(),
            group_id: self.group_id.clone(),
            is_group: self.is_group,
            raw: self.raw.clone(),
        }
    }
}

/// 出站消息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachments.is_empty()
    }
}

/// 投递目标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub user_id: String,
    pub group_id: Option<String>,
    pub is_group: bool,
    #[serde(default)]
    pub raw: Map<String, Value>,
}

impl DeliveryTarget {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

/// Peer 声明的工具 schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// 客户端 → 网关
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        #[serde(default)]
        api_key: Option<String>,
    },
    Message {
        text: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        images: Vec<String>,
    },
    RegisterTools {
        tools: Vec<ToolSchema>,
    },
    ToolResult {
        #[serde(alias = "callId")]
        call_id: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Status,
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

/// 网关 → 客户端
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthOk {
        connection_id: String,
    },
    Reply {
        text: String,
        session_id: String,
        attachments: Vec<String>,
    },
    Push {
        text: String,
    },
    ToolRequest {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolsRegistered {
        count: usize,
        names: Vec<String>,
    },
    Status {
        status: Value,
    },
    Pong {
        timestamp: u64,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
