//! 可组合的退避策略
//!
//! 策略本身（`BackoffPolicy`）是纯数据；需要重试的一方（Worker 监管、Channel 重连、MCP 客户端）各自持有一个
//! `Backoff` 驱动器并显式推进，不通过继承共享重连逻辑。

use std::time::{Duration, Instant};

/// 指数退避参数
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// 第一次重试前的等待
    pub initial_delay: Duration,
    /// 每次失败后的放大倍数
    pub multiplier: f64,
    /// 单次等待上限
    pub max_delay: Duration,
    /// 窗口内允许的最大尝试次数
    pub max_attempts: u32,
    /// 距上次尝试超过该时长则清零计数
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            reset_after: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// 第 `attempt` 次（从 1 开始）尝试前的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// 退避状态：记录尝试次数与最近一次尝试时间
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_attempt: None,
        }
    }

    /// 记录一次尝试并返回尝试前应等待的时长；超出预算返回 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) > self.policy.reset_after {
                self.attempts = 0;
            }
        }
        self.last_attempt = Some(now);
        self.attempts = self.attempts.saturating_add(1);

        if self.attempts > self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts > self.policy.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            max_attempts: 3,
            reset_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_budget_exhausted() {
        let mut backoff = Backoff::new(policy());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_reset_after_quiet_window() {
        let mut backoff = Backoff::new(BackoffPolicy {
            reset_after: Duration::from_millis(10),
            ..policy()
        });
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.attempts(), 1);
    }
}
