//! 错误处理策略
//!
//! 按调用点选择策略，把一次失败映射为下一步动作：
//! - fail_fast：立即向上传播
//! - continue_on_error：记录后继续，累计失败达到阈值时中止
//! - retry：最多重试 N 次，尝试次数与退避时长一并返回给调用方

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::BbaiError;
use crate::llm::LlmError;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// 错误策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ErrorStrategy {
    FailFast,
    ContinueOnError { threshold: usize },
    Retry { max_retries: u32 },
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        ErrorStrategy::FailFast
    }
}

/// 处理一次失败后的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// 把错误交还调用方
    Propagate,
    /// 记录后继续下一个工作项
    Continue,
    /// 等待 delay 后进行第 attempt 次重试（从 1 开始）
    Retry { attempt: u32, delay: Duration },
    /// 失败次数达到阈值，停止后续工作
    Abort,
}

/// 错误处理器：策略 + 失败计数
#[derive(Debug)]
pub struct ErrorHandler {
    strategy: ErrorStrategy,
    base_delay: Duration,
    max_delay: Duration,
    failures: AtomicUsize,
}

impl ErrorHandler {
    pub fn new(strategy: ErrorStrategy) -> Self {
        Self {
            strategy,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn strategy(&self) -> ErrorStrategy {
        self.strategy
    }

    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// `attempts_so_far` 为该工作项已经重试过的次数
    pub fn handle(&self, err: &BbaiError, attempts_so_far: u32) -> ErrorDecision {
        if matches!(err, BbaiError::Cancelled) {
            return ErrorDecision::Propagate;
        }
        match self.strategy {
            ErrorStrategy::FailFast => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                ErrorDecision::Propagate
            }
            ErrorStrategy::ContinueOnError { threshold } => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= threshold.max(1) {
                    tracing::warn!(failures, threshold, error = %err, "error threshold reached");
                    ErrorDecision::Abort
                } else {
                    tracing::warn!(failures, error = %err, "continuing after error");
                    ErrorDecision::Continue
                }
            }
            ErrorStrategy::Retry { max_retries } => {
                if attempts_so_far < max_retries {
                    let attempt = attempts_so_far + 1;
                    let delay = self.backoff(attempt, err);
                    tracing::debug!(attempt, max_retries, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    ErrorDecision::Retry { attempt, delay }
                } else {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    ErrorDecision::Propagate
                }
            }
        }
    }

    /// 指数退避；限流错误至少等待服务端给出的时长
    pub fn backoff(&self, attempt: u32, err: &BbaiError) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        match err {
            BbaiError::Llm(LlmError::RateLimited { retry_after_ms }) => {
                delay.max(Duration::from_millis(*retry_after_ms))
            }
            _ => delay,
        }
    }

    /// 按 retry 策略执行；f 收到当前尝试序号（0 为首次）
    pub async fn run_with_retry<T, F, Fut>(&self, mut f: F) -> Result<T, BbaiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BbaiError>>,
    {
        let mut attempts = 0u32;
        loop {
            match f(attempts).await {
                Ok(v) => return Ok(v),
                Err(err) => match self.handle(&err, attempts) {
                    ErrorDecision::Retry { attempt, delay } => {
                        tokio::time::sleep(delay).await;
                        attempts = attempt;
                    }
                    _ => return Err(err),
                },
            }
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn api_err() -> BbaiError {
        BbaiError::Llm(LlmError::Api("down".into()))
    }

    #[test]
    fn test_fail_fast_propagates() {
        let h = ErrorHandler::new(ErrorStrategy::FailFast);
        assert_eq!(h.handle(&api_err(), 0), ErrorDecision::Propagate);
        assert_eq!(h.failure_count(), 1);
    }

    #[test]
    fn test_continue_until_threshold() {
        let h = ErrorHandler::new(ErrorStrategy::ContinueOnError { threshold: 3 });
        assert_eq!(h.handle(&api_err(), 0), ErrorDecision::Continue);
        assert_eq!(h.handle(&api_err(), 0), ErrorDecision::Continue);
        assert_eq!(h.handle(&api_err(), 0), ErrorDecision::Abort);
    }

    #[test]
    fn test_retry_surfaces_attempt_and_backoff() {
        let h = ErrorHandler::new(ErrorStrategy::Retry { max_retries: 2 })
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(
            h.handle(&api_err(), 0),
            ErrorDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            h.handle(&api_err(), 1),
            ErrorDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(h.handle(&api_err(), 2), ErrorDecision::Propagate);
    }

    #[test]
    fn test_rate_limit_extends_backoff() {
        let h = ErrorHandler::new(ErrorStrategy::Retry { max_retries: 1 })
            .with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        let err = BbaiError::Llm(LlmError::RateLimited { retry_after_ms: 400 });
        assert_eq!(h.backoff(1, &err), Duration::from_millis(400));
    }

    #[test]
    fn test_cancelled_is_never_retried() {
        let h = ErrorHandler::new(ErrorStrategy::Retry { max_retries: 5 });
        assert_eq!(h.handle(&BbaiError::Cancelled, 0), ErrorDecision::Propagate);
    }

    #[tokio::test]
    async fn test_run_with_retry_eventually_succeeds() {
        let h = ErrorHandler::new(ErrorStrategy::Retry { max_retries: 3 })
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let out = h
            .run_with_retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(api_err())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
