//! MessageBus - 生产者（Channel / WebSocket）与单一消费循环之间的入站队列
//!
//! - `publish(msg, want_reply)`：包装成 `Envelope` 入队；需要回复时挂起等待回复槽被写入
//! - `consume()` / `consume_timeout()`：严格 FIFO 取出信封
//!
//! 总线不做重投，也不替调用方设超时：`want_reply=true` 的调用方必须自己用 `tokio::time::timeout` 兜底。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::message::{IncomingMessage, OutgoingMessage};
use crate::core::BusError;

/// 一次性回复槽：`resolve` 消费自身，不可能被写入两次
#[derive(Debug)]
pub struct ReplySlot {
    tx: oneshot::Sender<OutgoingMessage>,
}

impl ReplySlot {
    /// 写入回复；等待方已放弃时返回 false
    pub fn resolve(self, reply: OutgoingMessage) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// 总线上的工作单元
#[derive(Debug)]
pub struct Envelope {
    pub id: String,
    pub message: IncomingMessage,
    pub reply: Option<ReplySlot>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message: IncomingMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message,
            reply: None,
            created_at: Utc::now(),
        }
    }

    fn with_reply(message: IncomingMessage) -> (Self, oneshot::Receiver<OutgoingMessage>) {
        let (tx, rx) = oneshot::channel();
        let mut envelope = Self::new(message);
        envelope.reply = Some(ReplySlot { tx });
        (envelope, rx)
    }

    /// 取出回复槽（只能取一次）
    pub fn take_reply(&mut self) -> Option<ReplySlot> {
        self.reply.take()
    }

    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

/// 异步消息总线
pub struct MessageBus {
    inbox_tx: mpsc::UnboundedSender<Envelope>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    pending: AtomicUsize,
    closed: CancellationToken,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            pending: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// 发布消息
    ///
    /// `want_reply=false` 时入队后立即返回 `Ok(None)`；为 true 时挂起直到消费方写入回复。
    pub async fn publish(
        &self,
        message: IncomingMessage,
        want_reply: bool,
    ) -> Result<Option<OutgoingMessage>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        if !want_reply {
            let envelope = Envelope::new(message);
            self.enqueue(envelope)?;
            return Ok(None);
        }

        let (envelope, reply_rx) = Envelope::with_reply(message);
        self.enqueue(envelope)?;
        reply_rx.await.map(Some).map_err(|_| BusError::ReplyDropped)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), BusError> {
        tracing::debug!(
            envelope = %envelope.short_id(),
            channel = %envelope.message.channel,
            user = %envelope.message.user_id,
            "Published message"
        );
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.inbox_tx.send(envelope).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            BusError::Closed
        })
    }

    /// 取一条消息（挂起直到有消息）；总线关闭且队列已空时返回 None
    pub async fn consume(&self) -> Option<Envelope> {
        let mut rx = self.inbox_rx.lock().await;
        tokio::select! {
            biased;
            envelope = rx.recv() => envelope.map(|e| self.taken(e)),
            _ = self.closed.cancelled() => rx.try_recv().ok().map(|e| self.taken(e)),
        }
    }

    /// 带超时地取消息，超时返回 None（驱动周期性唤醒）
    pub async fn consume_timeout(&self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.consume())
            .await
            .ok()
            .flatten()
    }

    fn taken(&self, envelope: Envelope) -> Envelope {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        envelope
    }

    /// inbox 中待处理的消息数
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// 关闭后 publish 立即失败；已入队的消息仍可被取走
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            tracing::info!("MessageBus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
