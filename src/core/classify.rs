//! 重试资格判定
//!
//! 纯函数：根据 Failure 返回 Retry / NoRetry，供 GuardedCall 决定是退避重试、包装还是透传。

use crate::core::error::ErrorKind;
use crate::core::Failure;

pub const HTTP_STATUS_SERVER_ERROR_MIN: u16 = 500;
pub const HTTP_STATUS_SERVER_ERROR_MAX: u16 = 600;

/// 重试判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

impl RetryDecision {
    pub fn should_retry(self) -> bool {
        matches!(self, RetryDecision::Retry)
    }
}

/// 判定表：
/// - Validation / Configuration：调用方错误，不重试
/// - ExternalService / LanguageModel / Export：重试，除非 context 显式 `no_retry: true`
/// - AgentCreation / Orchestration：终态聚合错误，不重试
/// - 连接失败 / 超时：重试
/// - HTTP 错误：仅 [500, 600) 重试
/// - 其余未知错误：不重试（不假设未知错误是瞬时的）
pub fn classify(failure: &Failure) -> RetryDecision {
    match failure {
        Failure::Domain(err) => match err.kind() {
            ErrorKind::Validation | ErrorKind::Configuration => RetryDecision::NoRetry,
            ErrorKind::ExternalService | ErrorKind::LanguageModel | ErrorKind::Export => {
                if err.is_no_retry() {
                    RetryDecision::NoRetry
                } else {
                    RetryDecision::Retry
                }
            }
            ErrorKind::AgentCreation | ErrorKind::Orchestration => RetryDecision::NoRetry,
        },
        Failure::Connection(_) | Failure::Timeout(_) => RetryDecision::Retry,
        Failure::Http { status, .. } => {
            if is_server_error(*status) {
                RetryDecision::Retry
            } else {
                RetryDecision::NoRetry
            }
        }
        Failure::Other(_) => RetryDecision::NoRetry,
    }
}

pub fn is_server_error(status: u16) -> bool {
    (HTTP_STATUS_SERVER_ERROR_MIN..HTTP_STATUS_SERVER_ERROR_MAX).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SurveyError;

    #[test]
    fn test_network_errors_are_retried() {
        assert_eq!(classify(&Failure::connection("down")), RetryDecision::Retry);
        assert_eq!(classify(&Failure::timeout("slow")), RetryDecision::Retry);
    }

    #[test]
    fn test_transient_domain_errors_are_retried() {
        let arxiv = Failure::from(SurveyError::external_service("arXiv", "arXiv down"));
        let llm = Failure::from(SurveyError::language_model("OpenAI rate limit"));
        let export = Failure::from(SurveyError::export("File system full"));
        assert!(classify(&arxiv).should_retry());
        assert!(classify(&llm).should_retry());
        assert!(classify(&export).should_retry());
    }

    #[test]
    fn test_no_retry_flag_is_respected() {
        let err = SurveyError::external_service("arXiv", "Empty query").no_retry();
        assert_eq!(classify(&Failure::from(err)), RetryDecision::NoRetry);
    }

    #[test]
    fn test_caller_mistakes_are_not_retried() {
        let validation = Failure::from(SurveyError::validation("Invalid input"));
        let config = Failure::from(SurveyError::configuration("Missing API key"));
        assert_eq!(classify(&validation), RetryDecision::NoRetry);
        assert_eq!(classify(&config), RetryDecision::NoRetry);
    }

    #[test]
    fn test_aggregation_errors_are_not_retried() {
        let agent = Failure::from(SurveyError::agent_creation("all providers failed"));
        let orch = Failure::from(SurveyError::orchestration("stream broke"));
        assert_eq!(classify(&agent), RetryDecision::NoRetry);
        assert_eq!(classify(&orch), RetryDecision::NoRetry);
    }

    #[test]
    fn test_http_status_boundaries() {
        assert_eq!(classify(&Failure::http(499, "x")), RetryDecision::NoRetry);
        assert_eq!(classify(&Failure::http(500, "x")), RetryDecision::Retry);
        assert_eq!(classify(&Failure::http(503, "x")), RetryDecision::Retry);
        assert_eq!(classify(&Failure::http(599, "x")), RetryDecision::Retry);
        assert_eq!(classify(&Failure::http(600, "x")), RetryDecision::NoRetry);
        assert_eq!(classify(&Failure::http(404, "x")), RetryDecision::NoRetry);
    }

    #[test]
    fn test_unknown_errors_are_not_retried() {
        assert_eq!(classify(&Failure::other("Unknown error")), RetryDecision::NoRetry);
    }
}
