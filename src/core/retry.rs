//! 非流式调用的重试包装
//!
//! 按 LlmError::is_transient 区分瞬时 / 致命错误；瞬时错误按指数退避（带抖动）重试，
//! 次数封顶；限流时至少等待服务端给出的 retry-after。

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetrySection;
use crate::llm::LlmError;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 抖动比例（0.0 - 1.0）
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(s: &RetrySection) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            multiplier: s.multiplier,
            jitter: s.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// 第 attempt 次失败后（从 0 计）的等待时长，不含抖动
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// 带抖动的等待时长
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base * (1.0 + factor)).max(0.0))
    }
}

/// 执行 op，瞬时错误按策略重试；致命错误或次数用尽时返回最后一个错误
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let mut delay = policy.delay_for_attempt(attempt);
                if let Some(hint) = e.retry_hint() {
                    delay = delay.max(hint);
                }
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::warn!(op = op_name, attempts = attempt + 1, error = %e, "giving up");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_base_delay_is_exponential_and_capped() {
        let p = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(p.base_delay(0), Duration::from_millis(100));
        assert_eq!(p.base_delay(1), Duration::from_millis(200));
        assert_eq!(p.base_delay(2), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = RetryPolicy {
            jitter: 0.2,
            initial_delay: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = p.delay_for_attempt(0).as_millis();
            assert!((800..=1200).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::default(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(LlmError::Server { status: 502, body: String::new() })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Rejected { status: 400, body: "bad".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let result: Result<(), _> = retry_with_backoff(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Network("reset".into())) }
        })
        .await;
        assert!(matches!(result, Err(LlmError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
