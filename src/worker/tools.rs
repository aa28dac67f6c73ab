//! Worker 本地工具注册表
//!
//! 每个 Worker 启动时自己构建一份注册表（不存在进程级全局注册表），请求里只带工具名，
//! 由这里按名解析。工具失败以 `Err(String)` 返回，作为数据交给 Agent。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::protocol::{PendingPush, SchedulerOp, Trigger};

/// Worker 端的 Scheduler 代理：只记录操作，本地缓存仅供查询
#[derive(Debug, Default)]
pub struct SchedulerProxy {
    ops: Vec<SchedulerOp>,
    jobs: HashMap<String, Trigger>,
}

impl SchedulerProxy {
    pub fn add_job(
        &mut self,
        job_id: String,
        trigger: Trigger,
        kwargs: Map<String, Value>,
        replace_existing: bool,
    ) {
        self.jobs.insert(job_id.clone(), trigger.clone());
        self.ops.push(SchedulerOp::Add {
            job_id,
            trigger,
            kwargs,
            replace_existing,
        });
    }

    pub fn remove_job(&mut self, job_id: &str) {
        self.jobs.remove(job_id);
        self.ops.push(SchedulerOp::Remove {
            job_id: job_id.to_string(),
        });
    }

    /// 本次请求内已知的任务（不含网关侧已有的任务）
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }
}

#[derive(Debug, Default)]
struct Collected {
    pushes: Vec<PendingPush>,
    attachments: Vec<String>,
    scheduler: SchedulerProxy,
}

/// 单次请求的副作用收集器
///
/// 需要网关资源的动作（推送、定时任务）不在 Worker 里执行，只在这里累积成描述，随响应返回。
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    inner: Arc<Mutex<Collected>>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_push(&self, channel: &str, user_id: &str, text: &str) {
        self.with(|c| {
            c.pushes.push(PendingPush {
                channel: channel.to_string(),
                user_id: user_id.to_string(),
                text: text.to_string(),
            })
        });
    }

    pub fn attach(&self, path: &str) {
        self.with(|c| c.attachments.push(path.to_string()));
    }

    pub fn with_scheduler<T>(&self, f: impl FnOnce(&mut SchedulerProxy) -> T) -> T {
        self.with(|c| f(&mut c.scheduler))
    }

    /// 取出累积的副作用：(attachments, pushes, scheduler_ops)
    pub fn drain(&self) -> (Vec<String>, Vec<PendingPush>, Vec<SchedulerOp>) {
        self.with(|c| {
            (
                std::mem::take(&mut c.attachments),
                std::mem::take(&mut c.pushes),
                std::mem::take(&mut c.scheduler.ops),
            )
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut Collected) -> T) -> T {
        // 工具 panic 时锁会中毒，但收集的数据本身仍然有效
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// 工具 trait：名称、描述、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置工具：send_message / scheduler_add / scheduler_remove / attach_file
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SendMessageTool);
        registry.register(SchedulerAddTool);
        registry.register(SchedulerRemoveTool);
        registry.register(AttachFileTool);
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 按请求中的工具名挑出子集；本 Worker 不认识的名字会被跳过并记录
    pub fn resolve(&self, names: &[String]) -> ToolRegistry {
        let mut tools = HashMap::new();
        for name in names {
            match self.tools.get(name) {
                Some(tool) => {
                    tools.insert(name.clone(), Arc::clone(tool));
                }
                None => tracing::debug!(tool = %name, "Tool not available in this worker"),
            }
        }
        ToolRegistry { tools }
    }

    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args, ctx).await
    }

    /// 生成供 LLM 使用的 function schema 列表
    pub fn schemas(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let tool = &self.tools[name];
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect()
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing argument: {key}"))
}

/// 向某个 Channel 的用户推送消息
pub struct SendMessageTool;

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to a user on a channel. Args: channel, user_id, text"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "channel": {"type": "string"},
                "user_id": {"type": "string"},
                "text": {"type": "string"}
            },
            "required": ["channel", "user_id", "text"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let channel = required_str(&args, "channel")?;
        let user_id = required_str(&args, "user_id")?;
        let text = required_str(&args, "text")?;
        ctx.send_push(channel, user_id, text);
        Ok(format!("Message queued for {channel}:{user_id}"))
    }
}

/// 添加定时提醒：`run_date`（RFC 3339）或 `interval_secs` 二选一
pub struct SchedulerAddTool;

#[async_trait]
impl Tool for SchedulerAddTool {
    fn name(&self) -> &str {
        "scheduler_add"
    }

    fn description(&self) -> &str {
        "Schedule a reminder. Args: channel, user_id, content, and run_date (RFC 3339) or interval_secs"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "channel": {"type": "string"},
                "user_id": {"type": "string"},
                "content": {"type": "string"},
                "run_date": {"type": "string"},
                "interval_secs": {"type": "integer"},
                "job_id": {"type": "string"}
            },
            "required": ["channel", "user_id", "content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let channel = required_str(&args, "channel")?;
        let user_id = required_str(&args, "user_id")?;
        let content = required_str(&args, "content")?;

        let trigger = match (
            args.get("run_date").and_then(Value::as_str),
            args.get("interval_secs").and_then(Value::as_u64),
        ) {
            (Some(date), _) => {
                let run_date = DateTime::parse_from_rfc3339(date)
                    .map_err(|e| format!("Invalid run_date '{date}': {e}"))?
                    .with_timezone(&Utc);
                Trigger::Date { run_date }
            }
            (None, Some(seconds)) if seconds > 0 => Trigger::Interval { seconds },
            _ => return Err("Either run_date or a positive interval_secs is required".to_string()),
        };

        let job_id = args
            .get("job_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("reminder_{user_id}_{}", &suffix[..8])
            });

        let mut kwargs = Map::new();
        kwargs.insert("channel".into(), Value::String(channel.to_string()));
        kwargs.insert("user_id".into(), Value::String(user_id.to_string()));
        kwargs.insert("text".into(), Value::String(format!("⏰ 提醒: {content}")));

        let summary = match &trigger {
            Trigger::Date { run_date } => format!("at {}", run_date.to_rfc3339()),
            Trigger::Interval { seconds } => format!("every {seconds}s"),
        };
        ctx.with_scheduler(|s| s.add_job(job_id.clone(), trigger, kwargs, true));
        Ok(format!("Reminder {job_id} scheduled {summary}"))
    }
}

/// 删除定时提醒
pub struct SchedulerRemoveTool;

#[async_trait]
impl Tool for SchedulerRemoveTool {
    fn name(&self) -> &str {
        "scheduler_remove"
    }

    fn description(&self) -> &str {
        "Remove a scheduled reminder. Args: job_id"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "job_id": {"type": "string"} },
            "required": ["job_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let job_id = required_str(&args, "job_id")?;
        ctx.with_scheduler(|s| s.remove_job(job_id));
        Ok(format!("Reminder {job_id} removed"))
    }
}

/// 把文件作为附件随回复发送
pub struct AttachFileTool;

#[async_trait]
impl Tool for AttachFileTool {
    fn name(&self) -> &str {
        "attach_file"
    }

    fn description(&self) -> &str {
        "Attach a file to the reply. Args: path"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "path": {"type": "string"} },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let path = required_str(&args, "path")?;
        ctx.attach(path);
        Ok(format!("Attached {path}"))
    }
}
