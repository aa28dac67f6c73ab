//! Worker 本地运行时：Agent 表 + 工具注册表
//!
//! `AgentRuntime::execute` 是唯一的执行入口，Worker 进程和嵌入式 AgentClient 共用；
//! 任何执行错误（包括 panic）都转成 `AgentResponse { success: false, error }`，不会向外抛。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use super::protocol::{AgentRequest, AgentResponse};
use super::tools::{ToolContext, ToolRegistry};
use crate::core::AgentError;

pub const DEFAULT_AGENT: &str = "default";

/// Agent 抽象：给定请求与可用工具，返回回复文本；副作用通过 ToolContext 记录
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn run(
        &self,
        request: &AgentRequest,
        tools: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Result<String, AgentError>;
}

/// 离线回显 Agent
///
/// 以 `/工具名 {json}` 开头的行作为工具调用执行（仅限请求允许的工具），其余行原样回显；
/// 没有普通文本时回复工具结果。
pub struct EchoAgent {
    id: String,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    fn parse_command(line: &str) -> Option<(&str, serde_json::Value)> {
        let rest = line.strip_prefix('/')?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        if name.is_empty() {
            return None;
        }
        let args = if args.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(args).ok()?
        };
        Some((name, args))
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        request: &AgentRequest,
        tools: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Result<String, AgentError> {
        let max_calls = request.msg_context.max_iterations.map(|n| n as usize);
        let mut text_lines = Vec::new();
        let mut tool_outputs = Vec::new();

        for line in request.user_text.lines() {
            let Some((name, args)) = Self::parse_command(line.trim()) else {
                text_lines.push(line);
                continue;
            };
            if max_calls.is_some_and(|max| tool_outputs.len() >= max) {
                tool_outputs.push(format!("{name}: skipped (iteration limit)"));
                continue;
            }
            let output = match tools.execute(name, args, ctx).await {
                Ok(out) => out,
                Err(e) => format!("Error: {e}"),
            };
            tool_outputs.push(output);
        }

        let text = text_lines.join("\n");
        if text.trim().is_empty() {
            Ok(tool_outputs.join("\n"))
        } else {
            Ok(text)
        }
    }
}

/// Agent 运行时（每个 Worker 一份）
#[derive(Clone)]
pub struct AgentRuntime {
    agents: HashMap<String, Arc<dyn Agent>>,
    tools: ToolRegistry,
}

impl AgentRuntime {
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            agents: HashMap::new(),
            tools,
        }
    }

    /// 内置工具 + `default` 回显 Agent
    pub fn builtin() -> Self {
        let mut runtime = Self::new(ToolRegistry::with_builtins());
        runtime.register_agent(EchoAgent::new(DEFAULT_AGENT));
        runtime
    }

    pub fn register_agent(&mut self, agent: impl Agent + 'static) {
        self.agents.insert(agent.id().to_string(), Arc::new(agent));
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// 执行一次请求；未知 agent_id 回退到 default
    pub async fn execute(&self, request: &AgentRequest) -> AgentResponse {
        let Some(agent) = self
            .agents
            .get(&request.agent_id)
            .or_else(|| self.agents.get(DEFAULT_AGENT))
        else {
            return AgentResponse::failure(
                &request.id,
                AgentError::NotFound(request.agent_id.clone()).to_string(),
            );
        };

        tracing::info!(
            request = %request.id,
            agent = %agent.id(),
            tools = ?request.tool_names,
            "Handling agent request"
        );

        let tools = self.tools.resolve(&request.tool_names);
        let ctx = ToolContext::new();

        let outcome = AssertUnwindSafe(agent.run(request, &tools, &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(AgentError::Panicked(panic_message(panic.as_ref()))));

        let (attachments, pending_pushes, pending_scheduler_ops) = ctx.drain();
        match outcome {
            Ok(text) => AgentResponse {
                id: request.id.clone(),
                success: true,
                text,
                attachments,
                pending_pushes,
                pending_scheduler_ops,
                error: None,
            },
            Err(e) => {
                tracing::error!(request = %request.id, "Agent execution failed: {}", e);
                AgentResponse::failure(&request.id, e.to_string())
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
