//! 核心韧性层：错误分类、重试判定、熔断器、受保护调用

pub mod circuit;
pub mod classify;
pub mod error;
pub mod failure;
pub mod retry;

pub use circuit::{
    BreakerConfig, CircuitBreakerRegistry, CircuitState, Clock, ManualClock, SystemClock,
    CIRCUIT_BREAKER_FAILURE_THRESHOLD, CIRCUIT_BREAKER_RECOVERY_TIMEOUT,
};
pub use classify::{classify, is_server_error, RetryDecision};
pub use error::{
    user_friendly_message, BoxError, ErrorDetails, ErrorKind, Severity, SurveyError, NO_RETRY_KEY,
};
pub use failure::Failure;
pub use retry::{Backoff, GuardedCall, RetryPolicy, ARXIV_SERVICE, EXPORT_SERVICE, LLM_SERVICE};
