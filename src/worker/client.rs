//! AgentClient - 网关侧调用 Agent 的统一入口
//!
//! 不论 Agent 在本进程执行还是发往 WorkerPool，调用方式和返回结果都一样。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::pool::{PoolStatus, WorkerPool};
use super::protocol::{AgentRequest, AgentResponse, HistoryEntry, MessageContext, PendingPush, SchedulerOp};
use super::runtime::AgentRuntime;
use crate::core::ClientError;

/// `AgentClient::run` 的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRunResult {
    pub text: String,
    pub attachments: Vec<String>,
    pub pending_pushes: Vec<PendingPush>,
    pub pending_scheduler_ops: Vec<SchedulerOp>,
}

/// 可用的 Agent 与工具清单
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalog {
    pub agents: Vec<String>,
    /// 工具的 function schema（name / description / parameters）
    pub tools: Vec<Value>,
}

impl Catalog {
    fn of(runtime: &AgentRuntime) -> Self {
        Self {
            agents: runtime.agent_ids(),
            tools: runtime.tools().schemas(),
        }
    }
}

/// 一次调用的输入
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub agent_id: String,
    pub user_text: String,
    pub history: Vec<HistoryEntry>,
    pub memories: Vec<String>,
    pub tool_names: Vec<String>,
    pub images: Vec<String>,
    pub msg_context: MessageContext,
}

impl RunInput {
    pub fn new(agent_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_text: user_text.into(),
            ..Default::default()
        }
    }

    fn into_request(self) -> AgentRequest {
        let mut request = AgentRequest::new(self.agent_id, self.user_text);
        request.history = self.history;
        request.memories = self.memories;
        request.tool_names = self.tool_names;
        request.images = self.images;
        request.msg_context = self.msg_context;
        request
    }
}

#[derive(Clone)]
enum Backend {
    /// 直接在当前进程执行
    Embedded(Arc<AgentRuntime>),
    /// 发往 Worker 子进程
    Pool(Arc<WorkerPool>),
}

/// Agent 客户端
#[derive(Clone)]
pub struct AgentClient {
    backend: Backend,
}

impl AgentClient {
    pub fn embedded(runtime: AgentRuntime) -> Self {
        Self {
            backend: Backend::Embedded(Arc::new(runtime)),
        }
    }

    pub fn pooled(pool: Arc<WorkerPool>) -> Self {
        Self {
            backend: Backend::Pool(pool),
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.backend, Backend::Embedded(_))
    }

    pub fn mode(&self) -> &'static str {
        match self.backend {
            Backend::Embedded(_) => "embedded",
            Backend::Pool(_) => "worker",
        }
    }

    /// 执行 Agent；执行失败返回 `ClientError::Agent`，池错误原样透传
    pub async fn run(&self, input: RunInput) -> Result<AgentRunResult, ClientError> {
        let request = input.into_request();
        let request_id = request.id.clone();
        tracing::debug!(
            request = %request_id,
            agent = %request.agent_id,
            tools = ?request.tool_names,
            mode = self.mode(),
            "Running agent"
        );

        let response = match &self.backend {
            Backend::Embedded(runtime) => runtime.execute(&request).await,
            Backend::Pool(pool) => pool.submit(request).await?,
        };

        let result = into_result(response)?;
        tracing::debug!(
            request = %request_id,
            text_len = result.text.len(),
            attachments = result.attachments.len(),
            pending_pushes = result.pending_pushes.len(),
            pending_scheduler_ops = result.pending_scheduler_ops.len(),
            "Agent run completed"
        );
        Ok(result)
    }

    /// 本客户端能执行的 Agent 与工具
    ///
    /// `switchboard worker` 子进程总是运行内置运行时，池模式按内置运行时列出。
    pub fn catalog(&self) -> Catalog {
        match &self.backend {
            Backend::Embedded(runtime) => Catalog::of(runtime),
            Backend::Pool(_) => Catalog::of(&AgentRuntime::builtin()),
        }
    }

    /// 池状态；嵌入模式下没有池
    pub async fn pool_status(&self) -> Option<PoolStatus> {
        match &self.backend {
            Backend::Embedded(_) => None,
            Backend::Pool(pool) => Some(pool.status().await),
        }
    }
}

fn into_result(response: AgentResponse) -> Result<AgentRunResult, ClientError> {
    if !response.success {
        let error = response.error.unwrap_or_else(|| "unknown error".to_string());
        tracing::error!(request = %response.id, "Agent execution failed: {}", error);
        return Err(ClientError::Agent(error));
    }
    Ok(AgentRunResult {
        text: response.text,
        attachments: response.attachments,
        pending_pushes: response.pending_pushes,
        pending_scheduler_ops: response.pending_scheduler_ops,
    })
}
