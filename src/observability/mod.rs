//! 可观测性：tracing 初始化、会话 span、结构化错误日志（经脱敏）

pub mod redact;

use std::error::Error as StdError;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use crate::core::{Severity, SurveyError};

pub use redact::{redact_display, sanitize_context, sanitize_field, REDACTED};

/// 安装全局 subscriber；RUST_LOG 未设置时默认 info。重复调用无副作用。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// 8 位十六进制会话 ID
pub fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// 会话 span：其中所有日志携带 session_id
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("session", session_id = %session_id)
}

/// 以结构化字段记录领域错误；上下文经脱敏后序列化
pub fn log_error_with_details(err: &SurveyError, operation: &str, component: &str) {
    let context = serde_json::to_string(&sanitize_context(err.context())).unwrap_or_default();
    let message = redact::redact_text(err.message());
    let cause = err
        .source()
        .map(|s| redact_display(&s))
        .unwrap_or_default();

    macro_rules! emit {
        ($level:ident) => {
            tracing::$level!(
                component,
                operation,
                error_id = err.id(),
                error_type = err.kind().name(),
                severity = %err.severity(),
                cause_type = err.cause_type().unwrap_or(""),
                cause = %cause,
                context = %context,
                "{}",
                message
            )
        };
    }

    match err.severity() {
        Severity::Info => emit!(info),
        Severity::Warning => emit!(warn),
        Severity::Error | Severity::Critical => emit!(error),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        let err = SurveyError::configuration("Missing key")
            .with_context("api_key", "sk-secret-value-123");
        let _guard = session_span("abcd1234").entered();
        log_error_with_details(&err, "load_config", "test");
    }

    #[test]
    fn test_error_details_are_redacted() {
        let (logs, _guard) = capture::logs();
        let err = SurveyError::external_service("arXiv", "upstream said token=tok-998877 for sk-live-abcdefgh1234")
            .with_context("api_key", "sk-context-secret-999");
        log_error_with_details(&err, "search", "test");

        let out = logs.contents();
        assert!(out.contains("search"));
        assert!(!out.contains("tok-998877"));
        assert!(!out.contains("sk-live-abcdefgh1234"));
        assert!(!out.contains("sk-context-secret-999"));
    }
}
