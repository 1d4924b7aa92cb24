//! 重试策略与受保护调用
//!
//! `GuardedCall::execute` 的单次调用状态机：
//! NotStarted → Attempting(n) → Succeeded | Retrying(n+1) → Attempting(n+1) | Exhausted
//!
//! 1. 先查熔断器，打开则立即失败（不调用、不退避）
//! 2. 调用操作；成功则记录熔断成功并返回
//! 3. 失败按 classify 判定：调用方错误记一次熔断失败后原样返回；可重试且仍有次数则退避后重试；
//!    否则记录熔断失败，包装为策略对应的领域错误（原因已是该领域类型时不重复包装）
//!
//! 每次调用的结局（成功、失败、取消）都会写入熔断器。日志中的错误文本统一经过脱敏。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::classify::{classify, RetryDecision};
use crate::core::{CircuitBreakerRegistry, ErrorKind, Failure, SurveyError};
use crate::observability::redact_display;

pub const ARXIV_SERVICE: &str = "arXiv";
pub const LLM_SERVICE: &str = "LLM";
pub const EXPORT_SERVICE: &str = "export";

/// 退避方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// 固定间隔
    Fixed(Duration),
    /// `multiplier * 2^(attempt-1)` 秒，截断到 [min, max]
    Exponential {
        multiplier: f64,
        min: Duration,
        max: Duration,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed(delay)
    }

    pub fn exponential(multiplier: f64, min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Backoff::Exponential {
            multiplier,
            min,
            max,
        }
    }

    /// 第 `attempt` 次尝试（从 1 开始）失败后的等待时长
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                multiplier,
                min,
                max,
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let raw = multiplier * 2f64.powi(exp);
                // f64::max / min 会吞掉 NaN，结果总落在 [min, max]
                let secs = raw.max(min.as_secs_f64()).min(max.as_secs_f64());
                // 接近 Duration::MAX 时 f64 舍入可能越界
                Duration::try_from_secs_f64(secs).unwrap_or(max)
            }
        }
    }
}

/// 不可变重试策略：每类受保护操作一份
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    service: String,
    max_attempts: u32,
    backoff: Backoff,
    domain: ErrorKind,
}

impl RetryPolicy {
    /// `max_attempts` 至少为 1
    pub fn new(
        service: impl Into<String>,
        max_attempts: u32,
        backoff: Backoff,
        domain: ErrorKind,
    ) -> Self {
        Self {
            service: service.into(),
            max_attempts: max_attempts.max(1),
            backoff,
            domain,
        }
    }

    /// arXiv 检索：3 次，指数退避 1s..4s
    pub fn external_search() -> Self {
        Self::new(
            ARXIV_SERVICE,
            3,
            Backoff::exponential(1.0, Duration::from_secs(1), Duration::from_secs(4)),
            ErrorKind::ExternalService,
        )
    }

    /// 语言模型调用：2 次，指数退避 2s..4s
    ///
    /// 熔断键为 "LLM"。提供方回退与 ResilientChat 通过 `for_service("LLM:<provider>")`
    /// 按提供方分别熔断，单个提供方故障不会拦下其他候选。
    pub fn language_model() -> Self {
        Self::new(
            LLM_SERVICE,
            2,
            Backoff::exponential(2.0, Duration::from_secs(2), Duration::from_secs(4)),
            ErrorKind::LanguageModel,
        )
    }

    /// 导出 / 文件操作：2 次，固定 1s
    pub fn export() -> Self {
        Self::new(
            EXPORT_SERVICE,
            2,
            Backoff::fixed(Duration::from_secs(1)),
            ErrorKind::Export,
        )
    }

    /// 同参数、不同熔断键的副本
    pub fn for_service(&self, service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..self.clone()
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// 耗尽时包装成的领域错误种类
    pub fn domain(&self) -> ErrorKind {
        self.domain
    }
}

/// 受保护调用：策略 + 熔断器注册表（+ 可选取消令牌）的显式组合
#[derive(Debug, Clone)]
pub struct GuardedCall {
    policy: RetryPolicy,
    breakers: Arc<CircuitBreakerRegistry>,
    cancel: Option<CancellationToken>,
}

impl GuardedCall {
    pub fn new(policy: RetryPolicy, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            policy,
            breakers,
            cancel: None,
        }
    }

    /// 调用方取消：在下一次退避开始前（或退避期间）终止
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// 执行受保护操作；`operation` 仅用于日志
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, SurveyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let service = self.policy.service();
        self.breakers.check(service)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            tracing::debug!(service, operation, attempt, "Starting guarded operation");

            let failure = match op().await {
                Ok(value) => {
                    self.breakers.record(service, true);
                    tracing::debug!(service, operation, attempt, "Guarded operation completed");
                    return Ok(value);
                }
                Err(Failure::Domain(err)) if err.kind().is_caller_mistake() => {
                    // 调用方错误：计入熔断，但不重试、不包装
                    self.breakers.record(service, false);
                    return Err(err);
                }
                Err(failure) => failure,
            };

            let decision = classify(&failure);
            if decision == RetryDecision::Retry && attempt < self.policy.max_attempts() {
                let delay = self.policy.backoff().delay_for_attempt(attempt);
                tracing::warn!(
                    service,
                    operation,
                    attempt,
                    error_type = failure.type_name(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying {} after error: {}",
                    operation,
                    redact_display(&failure)
                );
                if let Some(token) = &self.cancel {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            self.breakers.record(service, false);
                            return Err(self.cancelled_error(operation, attempt, failure));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            tracing::error!(
                service,
                operation,
                attempt,
                error_type = failure.type_name(),
                retryable = decision.should_retry(),
                "{} operation failed: {}",
                service,
                redact_display(&failure)
            );
            self.breakers.record(service, false);
            return Err(self.wrap_failure(operation, attempt, failure));
        }
    }

    fn wrap_failure(&self, operation: &str, attempts: u32, failure: Failure) -> SurveyError {
        let domain = self.policy.domain();
        match failure {
            Failure::Domain(err) if err.kind() == domain => err,
            other => {
                let cause_type = other.type_name();
                let message = format!("{} operation failed: {}", self.policy.service(), other);
                SurveyError::new(domain, message)
                    .with_context("service", self.policy.service())
                    .with_context("operation", operation)
                    .with_context("attempts", attempts)
                    .with_boxed_source(Box::new(other), cause_type)
            }
        }
    }

    fn cancelled_error(&self, operation: &str, attempts: u32, failure: Failure) -> SurveyError {
        let cause_type = failure.type_name();
        tracing::info!(
            service = self.policy.service(),
            operation,
            attempt = attempts,
            "Guarded operation cancelled before retry"
        );
        SurveyError::new(
            self.policy.domain(),
            format!("{} operation cancelled: {}", self.policy.service(), operation),
        )
        .with_user_message("The operation was cancelled.")
        .with_context("service", self.policy.service())
        .with_context("operation", operation)
        .with_context("attempts", attempts)
        .with_context("cancelled", true)
        .no_retry()
        .with_boxed_source(Box::new(failure), cause_type)
    }
}
