//! 网关进程持有的定时任务调度器
//!
//! Worker 只能描述 `SchedulerOp`，真正的任务在这里运行；到点时把 kwargs 里的
//! channel / user_id / text 组装成推送交给 Dispatcher。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use crate::core::SchedulerError;
use crate::worker::{PendingPush, SchedulerOp, Trigger};

/// 间隔任务的上限（100 年），超过的间隔无法换算成定时器时刻
pub const MAX_INTERVAL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Scheduler 句柄（显式注入 AgentLoop，不做进程级单例）
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn apply(&self, op: SchedulerOp) -> Result<(), SchedulerError>;

    async fn job_ids(&self) -> Vec<String>;
}

struct ScheduledJob {
    run_id: String,
    trigger: Trigger,
    token: CancellationToken,
}

struct SchedulerInner {
    dispatcher: Arc<Dispatcher>,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    shutdown: CancellationToken,
}

/// 基于 tokio 定时器的本地调度器
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Arc<SchedulerInner>,
}

impl LocalScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                dispatcher,
                jobs: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub async fn trigger_of(&self, job_id: &str) -> Option<Trigger> {
        self.inner.jobs.lock().await.get(job_id).map(|job| job.trigger.clone())
    }

    /// 取消所有任务；之后的 apply 返回 Closed
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let count = {
            let mut jobs = self.inner.jobs.lock().await;
            let count = jobs.len();
            jobs.clear();
            count
        };
        tracing::info!(jobs = count, "Scheduler stopped");
    }

    async fn add(
        &self,
        job_id: String,
        trigger: Trigger,
        kwargs: Map<String, Value>,
        replace_existing: bool,
    ) -> Result<(), SchedulerError> {
        let push = push_from_kwargs(&job_id, &kwargs)?;
        if let Trigger::Interval { seconds } = trigger {
            let reason = match seconds {
                0 => Some("interval must be positive".to_string()),
                s if s > MAX_INTERVAL_SECS => Some(format!("interval must not exceed {MAX_INTERVAL_SECS}s")),
                _ => None,
            };
            if let Some(reason) = reason {
                return Err(SchedulerError::InvalidJob { job_id, reason });
            }
        }

        let mut jobs = self.inner.jobs.lock().await;
        if let Some(existing) = jobs.get(&job_id) {
            if !replace_existing {
                return Err(SchedulerError::DuplicateJob(job_id));
            }
            existing.token.cancel();
            tracing::debug!(job = %job_id, "Replacing existing job");
        }

        let job = ScheduledJob {
            run_id: uuid::Uuid::new_v4().to_string(),
            trigger: trigger.clone(),
            token: self.inner.shutdown.child_token(),
        };
        tokio::spawn(run_job(
            Arc::clone(&self.inner),
            job_id.clone(),
            job.run_id.clone(),
            trigger,
            push,
            job.token.clone(),
        ));
        jobs.insert(job_id.clone(), job);
        tracing::info!(job = %job_id, "Job scheduled");
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<(), SchedulerError> {
        match self.inner.jobs.lock().await.remove(job_id) {
            Some(job) => {
                job.token.cancel();
                tracing::info!(job = %job_id, "Job removed");
                Ok(())
            }
            None => Err(SchedulerError::JobNotFound(job_id.to_string())),
        }
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn apply(&self, op: SchedulerOp) -> Result<(), SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::Closed);
        }
        match op {
            SchedulerOp::Add {
                job_id,
                trigger,
                kwargs,
                replace_existing,
            } => self.add(job_id, trigger, kwargs, replace_existing).await,
            SchedulerOp::Remove { job_id } => self.remove(&job_id).await,
        }
    }

    async fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn push_from_kwargs(job_id: &str, kwargs: &Map<String, Value>) -> Result<PendingPush, SchedulerError> {
    let field = |key: &str| {
        kwargs
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SchedulerError::InvalidJob {
                job_id: job_id.to_string(),
                reason: format!("missing kwargs.{key}"),
            })
    };
    Ok(PendingPush {
        channel: field("channel")?,
        user_id: field("user_id")?,
        text: field("text")?,
    })
}

async fn run_job(
    inner: Arc<SchedulerInner>,
    job_id: String,
    run_id: String,
    trigger: Trigger,
    push: PendingPush,
    token: CancellationToken,
) {
    match trigger {
        Trigger::Date { run_date } => {
            let delay = (run_date - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }
            fire(&inner.dispatcher, &job_id, &push).await;

            let mut jobs = inner.jobs.lock().await;
            if jobs.get(&job_id).is_some_and(|job| job.run_id == run_id) {
                jobs.remove(&job_id);
            }
        }
        Trigger::Interval { seconds } => {
            let period = Duration::from_secs(seconds);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => fire(&inner.dispatcher, &job_id, &push).await,
                    _ = token.cancelled() => return,
                }
            }
        }
    }
}

async fn fire(dispatcher: &Dispatcher, job_id: &str, push: &PendingPush) {
    tracing::info!(job = %job_id, channel = %push.channel, user = %push.user_id, "Job fired");
    if !dispatcher.send_push(push).await {
        tracing::warn!(job = %job_id, "Job push was not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::dispatcher::ChannelSink;
    use crate::gateway::message::{DeliveryTarget, OutgoingMessage};

    #[derive(Default)]
    struct CountingSink {
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelSink for CountingSink {
        async fn deliver(&self, _target: &DeliveryTarget, message: OutgoingMessage) {
            self.texts.lock().await.push(message.text);
        }
    }

    async fn setup() -> (LocalScheduler, Arc<CountingSink>) {
        let dispatcher = Arc::new(Dispatcher::default());
        let sink = Arc::new(CountingSink::default());
        dispatcher.register_channel("telegram", sink.clone()).await;
        (LocalScheduler::new(dispatcher), sink)
    }

    fn kwargs(text: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("channel".into(), "telegram".into());
        map.insert("user_id".into(), "u1".into());
        map.insert("text".into(), text.into());
        map
    }

    fn add(job_id: &str, trigger: Trigger, text: &str, replace_existing: bool) -> SchedulerOp {
        SchedulerOp::Add {
            job_id: job_id.into(),
            trigger,
            kwargs: kwargs(text),
            replace_existing,
        }
    }

    #[tokio::test]
    async fn test_past_date_fires_once_and_clears() {
        let (scheduler, sink) = setup().await;
        let run_date = Utc::now() - chrono::Duration::seconds(1);
        scheduler
            .apply(add("once", Trigger::Date { run_date }, "⏰ 提醒: 开会", false))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*sink.texts.lock().await, vec!["⏰ 提醒: 开会".to_string()]);
        assert!(scheduler.job_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_replace() {
        let (scheduler, _) = setup().await;
        let later = Utc::now() + chrono::Duration::hours(1);
        scheduler
            .apply(add("j", Trigger::Date { run_date: later }, "a", false))
            .await
            .unwrap();

        let err = scheduler
            .apply(add("j", Trigger::Interval { seconds: 60 }, "b", false))
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateJob("j".into()));

        scheduler
            .apply(add("j", Trigger::Interval { seconds: 60 }, "b", true))
            .await
            .unwrap();
        assert_eq!(scheduler.trigger_of("j").await, Some(Trigger::Interval { seconds: 60 }));
        assert_eq!(scheduler.job_ids().await, vec!["j".to_string()]);
    }

    #[tokio::test]
    async fn test_interval_fires_until_removed() {
        let (scheduler, sink) = setup().await;
        scheduler
            .apply(add("tick", Trigger::Interval { seconds: 1 }, "tick", false))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;
        scheduler
            .apply(SchedulerOp::Remove { job_id: "tick".into() })
            .await
            .unwrap();
        let fired = sink.texts.lock().await.len();
        assert_eq!(fired, 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(sink.texts.lock().await.len(), fired);
    }

    #[tokio::test]
    async fn test_invalid_ops() {
        let (scheduler, _) = setup().await;
        let err = scheduler
            .apply(SchedulerOp::Remove { job_id: "ghost".into() })
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::JobNotFound("ghost".into()));

        let err = scheduler
            .apply(SchedulerOp::Add {
                job_id: "bad".into(),
                trigger: Trigger::Interval { seconds: 5 },
                kwargs: Map::new(),
                replace_existing: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJob { .. }));

        for seconds in [0, MAX_INTERVAL_SECS + 1, u64::MAX] {
            let err = scheduler
                .apply(add("huge", Trigger::Interval { seconds }, "x", false))
                .await
                .unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidJob { ref job_id, .. } if job_id == "huge"));
        }
        assert!(scheduler.job_ids().await.is_empty());

        // 上限本身可以调度，只是很久以后才触发
        scheduler
            .apply(add("century", Trigger::Interval { seconds: MAX_INTERVAL_SECS }, "x", false))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(scheduler.job_ids().await, vec!["century".to_string()]);

        scheduler.shutdown().await;
        let err = scheduler
            .apply(add("late", Trigger::Interval { seconds: 5 }, "x", false))
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::Closed);
    }
}
