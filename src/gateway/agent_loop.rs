//! AgentLoop - 总线的消费者
//!
//! 每条消息 spawn 一个任务并发处理：记录会话历史、路由、调用 AgentClient，
//! 在父进程执行 Agent 返回的副作用描述，最后回复。
//! `wake_interval` 大于 0 时，总线空闲一个周期就触发一次 system 唤醒。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::bus::{Envelope, MessageBus};
use super::dispatcher::{Dispatcher, RemoteToolBridge};
use super::message::{IncomingMessage, OutgoingMessage};
use super::scheduler::Scheduler;
use crate::core::ClientError;
use crate::worker::{AgentClient, AgentRunResult, HistoryEntry, MessageContext, RunInput, DEFAULT_AGENT};

/// 唤醒消息使用的 Channel
pub const SYSTEM_CHANNEL: &str = "system";

/// Agent 返回此标记表示不需要回复
pub const NO_REPLY: &str = "<NO_REPLY>";

const WAKE_PROMPT: &str = "[Periodic Wake] You are waking up for a routine check.\n\
Decide whether any of your duties require action right now and use tools as needed.\n\
Use send_message to notify users on the appropriate channel if you find something noteworthy.\n\
\n\
Constraints:\n\
- Do NOT re-execute old reminders or past scheduler tasks. They fire independently.\n\
- Do NOT add new scheduler_add during wake.\n\
- If nothing requires attention right now, respond with <NO_REPLY>.";

/// AgentLoop 配置
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub default_agent: String,
    pub default_tools: Vec<String>,
    /// channel → 额外工具
    pub channel_tools: HashMap<String, Vec<String>>,
    /// channel → owner user_id 列表
    pub channel_owners: HashMap<String, Vec<String>>,
    /// 每个会话保留的轮数（一轮 = user + assistant）
    pub history_turns: usize,
    /// None 表示不唤醒
    pub wake_interval: Option<Duration>,
    /// 唤醒时限制工具调用次数
    pub wake_max_iterations: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            default_agent: DEFAULT_AGENT.to_string(),
            default_tools: vec![
                "send_message".to_string(),
                "scheduler_add".to_string(),
                "scheduler_remove".to_string(),
                "attach_file".to_string(),
            ],
            channel_tools: HashMap::new(),
            channel_owners: HashMap::new(),
            history_turns: 20,
            wake_interval: None,
            wake_max_iterations: 3,
        }
    }
}

/// 内存中的会话历史（按会话限长）
pub struct SessionHistory {
    max_entries: usize,
    sessions: Mutex<HashMap<String, VecDeque<HistoryEntry>>>,
}

impl SessionHistory {
    pub fn new(turns: usize) -> Self {
        Self {
            max_entries: turns * 2,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(&self, session_id: &str, role: &str, content: &str) {
        if self.max_entries == 0 {
            return;
        }
        let mut sessions = self.sessions.lock().await;
        let entries = sessions.entry(session_id.to_string()).or_default();
        entries.push_back(HistoryEntry::new(role, content));
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub async fn recent(&self, session_id: &str) -> Vec<HistoryEntry> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

enum Next {
    Envelope(Envelope),
    Wake,
    Closed,
}

/// 总线消费循环
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    dispatcher: Arc<Dispatcher>,
    client: AgentClient,
    scheduler: Option<Arc<dyn Scheduler>>,
    settings: AgentSettings,
    history: SessionHistory,
    wake_running: AtomicBool,
    tracker: TaskTracker,
    stop: CancellationToken,
}

impl AgentLoop {
    pub fn new(bus: Arc<MessageBus>, dispatcher: Arc<Dispatcher>, client: AgentClient, settings: AgentSettings) -> Self {
        Self {
            bus,
            dispatcher,
            client,
            scheduler: None,
            history: SessionHistory::new(settings.history_turns),
            settings,
            wake_running: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    pub async fn run(self: Arc<Self>) {
        tracing::info!(wake_interval = ?self.settings.wake_interval, "AgentLoop entering main loop");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                next = self.next() => next,
            };
            match next {
                Next::Envelope(envelope) => {
                    let this = Arc::clone(&self);
                    self.tracker.spawn(async move { this.handle_envelope(envelope).await });
                }
                Next::Wake => self.wake(),
                Next::Closed => {
                    tracing::info!("Bus closed, AgentLoop exiting");
                    break;
                }
            }
        }
    }

    async fn next(&self) -> Next {
        match self.settings.wake_interval {
            Some(interval) => match self.bus.consume_timeout(interval).await {
                Some(envelope) => Next::Envelope(envelope),
                None if self.bus.is_closed() => Next::Closed,
                None => Next::Wake,
            },
            None => self.bus.consume().await.map_or(Next::Closed, Next::Envelope),
        }
    }

    /// 上一次唤醒仍在处理时跳过
    fn wake(self: &Arc<Self>) {
        if self.wake_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Skipping periodic wake: previous wake still running");
            return;
        }
        let mut message = IncomingMessage::new(SYSTEM_CHANNEL, SYSTEM_CHANNEL, WAKE_PROMPT);
        message.reply_expected = false;
        let envelope = Envelope::new(message);
        tracing::debug!(envelope = %envelope.short_id(), "Periodic wake");

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.handle_envelope(envelope).await;
            this.wake_running.store(false, Ordering::SeqCst);
        });
    }

    /// 处理一条消息；任何错误都转成回复文本
    pub async fn handle_envelope(&self, mut envelope: Envelope) {
        let reply = match self.process(&envelope.message).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                if let Some(slot) = envelope.take_reply() {
                    slot.resolve(OutgoingMessage::default());
                }
                return;
            }
            Err(e) => {
                tracing::error!(envelope = %envelope.short_id(), "Error handling message: {}", e);
                OutgoingMessage::text(format!("处理消息时出错: {e}"))
            }
        };

        if reply.is_empty() && envelope.reply.is_none() {
            tracing::debug!(envelope = %envelope.short_id(), "Nothing to reply");
            return;
        }
        self.dispatcher.dispatch_reply(&mut envelope, reply).await;
    }

    async fn process(&self, message: &IncomingMessage) -> Result<Option<OutgoingMessage>, ClientError> {
        let session_id = message.session_id();
        let is_system = message.channel == SYSTEM_CHANNEL;

        let history = if is_system {
            Vec::new()
        } else {
            let history = self.history.recent(&session_id).await;
            self.history.record(&session_id, "user", &message.text).await;
            history
        };

        // 群聊未 @ 等：只记录
        if !message.reply_expected && !is_system {
            return Ok(None);
        }

        let input = RunInput {
            agent_id: self.route_agent(message),
            user_text: message.text.clone(),
            history,
            memories: Vec::new(),
            tool_names: self.route_tools(&message.channel).await,
            images: message.images.clone(),
            msg_context: self.message_context(message, session_id.clone()).await,
        };
        let result = self.client.run(input).await?;
        self.apply_side_effects(&result).await;

        if result.text.contains(NO_REPLY) {
            tracing::debug!(user = %message.user_id, "Agent returned NO_REPLY");
            return Ok(Some(OutgoingMessage::default()));
        }
        if !is_system {
            self.history.record(&session_id, "assistant", &result.text).await;
        }
        Ok(Some(OutgoingMessage {
            text: result.text,
            attachments: result.attachments,
        }))
    }

    fn route_agent(&self, message: &IncomingMessage) -> String {
        message
            .raw
            .get("agent_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.settings.default_agent)
            .to_string()
    }

    async fn route_tools(&self, channel: &str) -> Vec<String> {
        let mut tools = self.settings.default_tools.clone();
        for tool in self.settings.channel_tools.get(channel).into_iter().flatten() {
            if !tools.contains(tool) {
                tools.push(tool.clone());
            }
        }
        // 远程工具只能在父进程里调用
        if self.client.is_embedded() && !self.dispatcher.remote_tool_schemas().await.is_empty() {
            tools.push(RemoteToolBridge::NAME.to_string());
        }
        tools
    }

    async fn message_context(&self, message: &IncomingMessage, session_id: String) -> MessageContext {
        let is_owner = self
            .settings
            .channel_owners
            .get(&message.channel)
            .is_some_and(|owners| owners.contains(&message.user_id));
        MessageContext {
            user_id: message.user_id.clone(),
            channel: message.channel.clone(),
            session_id,
            timestamp: Some(message.timestamp),
            is_group: message.is_group,
            group_id: message.group_id.clone(),
            is_owner,
            available_channels: self.dispatcher.list_channels().await,
            attachments: message.attachments.clone(),
            max_iterations: (message.channel == SYSTEM_CHANNEL).then_some(self.settings.wake_max_iterations),
            raw: message.raw.clone(),
        }
    }

    async fn apply_side_effects(&self, result: &AgentRunResult) {
        for push in &result.pending_pushes {
            if !self.dispatcher.send_push(push).await {
                tracing::warn!(channel = %push.channel, user = %push.user_id, "Pending push was not delivered");
            }
        }
        for op in &result.pending_scheduler_ops {
            match &self.scheduler {
                Some(scheduler) => {
                    if let Err(e) = scheduler.apply(op.clone()).await {
                        tracing::warn!(job = %op.job_id(), "Scheduler op failed: {}", e);
                    }
                }
                None => tracing::warn!(job = %op.job_id(), "No scheduler configured, dropping op"),
            }
        }
    }

    /// 停止消费并等待处理中的消息完成
    pub async fn stop(&self) {
        tracing::info!("Stopping AgentLoop...");
        self.stop.cancel();
        self.tracker.close();
        let in_flight = self.in_flight();
        if in_flight > 0 {
            tracing::info!(tasks = in_flight, "Waiting for active tasks to finish");
        }
        self.tracker.wait().await;
        tracing::info!("AgentLoop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AgentError;
    use crate::gateway::dispatcher::ChannelSink;
    use crate::gateway::message::DeliveryTarget;
    use crate::gateway::scheduler::LocalScheduler;
    use crate::worker::{Agent, AgentRequest, AgentRuntime, ToolContext, ToolRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelSink for RecordingSink {
        async fn deliver(&self, target: &DeliveryTarget, message: OutgoingMessage) {
            self.delivered.lock().await.push((target.user_id.clone(), message.text));
        }
    }

    struct Harness {
        bus: Arc<MessageBus>,
        agent_loop: Arc<AgentLoop>,
        sink: Arc<RecordingSink>,
        scheduler: LocalScheduler,
    }

    async fn harness(client: AgentClient, settings: AgentSettings) -> Harness {
        let bus = Arc::new(MessageBus::new());
        let dispatcher = Arc::new(Dispatcher::default());
        let sink = Arc::new(RecordingSink::default());
        dispatcher.register_channel("telegram", sink.clone()).await;
        let scheduler = LocalScheduler::new(Arc::clone(&dispatcher));
        let agent_loop = Arc::new(
            AgentLoop::new(Arc::clone(&bus), dispatcher, client, settings)
                .with_scheduler(Arc::new(scheduler.clone())),
        );
        agent_loop.start();
        Harness {
            bus,
            agent_loop,
            sink,
            scheduler,
        }
    }

    async fn ask(bus: &MessageBus, message: IncomingMessage) -> OutgoingMessage {
        tokio::time::timeout(Duration::from_secs(5), bus.publish(message, true))
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reply_and_history() {
        let h = harness(AgentClient::embedded(AgentRuntime::builtin()), AgentSettings::default()).await;

        let reply = ask(&h.bus, IncomingMessage::new("cli", "u1", "hello")).await;
        assert_eq!(reply.text, "hello");

        let history = h.agent_loop.history().recent("cli:dm:u1").await;
        assert_eq!(history, vec![HistoryEntry::new("user", "hello"), HistoryEntry::new("assistant", "hello")]);
        h.agent_loop.stop().await;
    }

    #[tokio::test]
    async fn test_reply_not_expected_only_records() {
        let h = harness(AgentClient::embedded(AgentRuntime::builtin()), AgentSettings::default()).await;

        let mut message = IncomingMessage::new("telegram", "u1", "随便聊聊").in_group("g1");
        message.reply_expected = false;
        let reply = ask(&h.bus, message).await;
        assert!(reply.is_empty());

        let history = h.agent_loop.history().recent("telegram:group:g1:user:u1").await;
        assert_eq!(history, vec![HistoryEntry::new("user", "随便聊聊")]);
        assert!(h.sink.delivered.lock().await.is_empty());
        h.agent_loop.stop().await;
    }

    #[tokio::test]
    async fn test_side_effects_run_in_parent() {
        let h = harness(AgentClient::embedded(AgentRuntime::builtin()), AgentSettings::default()).await;

        let text = "/send_message {\"channel\":\"telegram\",\"user_id\":\"u2\",\"text\":\"ping\"}\n\
                    /scheduler_add {\"channel\":\"telegram\",\"user_id\":\"u1\",\"content\":\"喝水\",\"interval_secs\":3600}";
        let reply = ask(&h.bus, IncomingMessage::new("telegram", "u1", text)).await;
        assert!(reply.text.contains("Message queued for telegram:u2"));

        assert!(h
            .sink
            .delivered
            .lock()
            .await
            .contains(&("u2".to_string(), "ping".to_string())));

        // 回复同时投递到来源 Channel（在回复槽之后）
        let mut replied_to_channel = false;
        for _ in 0..50 {
            if h.sink.delivered.lock().await.iter().any(|(user, _)| user == "u1") {
                replied_to_channel = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replied_to_channel);

        let jobs = h.scheduler.job_ids().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].starts_with("reminder_u1_"));
        h.agent_loop.stop().await;
    }

    #[tokio::test]
    async fn test_no_reply_marker() {
        let h = harness(AgentClient::embedded(AgentRuntime::builtin()), AgentSettings::default()).await;

        let reply = ask(&h.bus, IncomingMessage::new("cli", "u1", "<NO_REPLY>")).await;
        assert!(reply.is_empty());
        assert_eq!(h.agent_loop.history().recent("cli:dm:u1").await.len(), 1);
        h.agent_loop.stop().await;
    }

    #[tokio::test]
    async fn test_agent_error_becomes_reply() {
        let client = AgentClient::embedded(AgentRuntime::new(ToolRegistry::new()));
        let h = harness(client, AgentSettings::default()).await;

        let reply = ask(&h.bus, IncomingMessage::new("cli", "u1", "hi")).await;
        assert_eq!(reply.text, "处理消息时出错: Agent error: Agent 'default' not found");
        h.agent_loop.stop().await;
    }

    struct SlowWakeAgent {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        contexts: Arc<Mutex<Vec<(String, Option<u32>, usize)>>>,
    }

    #[async_trait]
    impl Agent for SlowWakeAgent {
        fn id(&self) -> &str {
            DEFAULT_AGENT
        }

        async fn run(&self, request: &AgentRequest, _: &ToolRegistry, _: &ToolContext) -> Result<String, AgentError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().await.push((
                request.msg_context.channel.clone(),
                request.msg_context.max_iterations,
                request.history.len(),
            ));
            tokio::time::sleep(Duration::from_millis(400)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(NO_REPLY.to_string())
        }
    }

    #[tokio::test]
    async fn test_wake_skips_while_running_and_stop_waits() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let contexts = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = AgentRuntime::new(ToolRegistry::with_builtins());
        runtime.register_agent(SlowWakeAgent {
            started: started.clone(),
            finished: finished.clone(),
            contexts: contexts.clone(),
        });
        let settings = AgentSettings {
            wake_interval: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let h = harness(AgentClient::embedded(runtime), settings).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        h.agent_loop.stop().await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(*contexts.lock().await, vec![(SYSTEM_CHANNEL.to_string(), Some(3), 0)]);
        assert!(h.sink.delivered.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_session_history_is_bounded() {
        let history = SessionHistory::new(1);
        for i in 0..5 {
            history.record("s", "user", &i.to_string()).await;
        }
        let recent = history.recent("s").await;
        assert_eq!(recent, vec![HistoryEntry::new("user", "3"), HistoryEntry::new("user", "4")]);
        assert_eq!(history.session_count().await, 1);
    }
}
