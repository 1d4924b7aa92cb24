//! 受保护操作的失败类型
//!
//! GuardedCall 包裹的操作返回 `Result<T, Failure>`：既可以是领域错误（SurveyError），
//! 也可以是外来错误（连接失败、超时、带 HTTP 状态码的错误、未知错误）。
//! classify 只看这个封闭集合做重试判定。

use std::error::Error as StdError;

use thiserror::Error;

use crate::core::error::{BoxError, SurveyError};

#[derive(Error, Debug)]
pub enum Failure {
    #[error(transparent)]
    Domain(#[from] SurveyError),

    #[error("connection failed: {0}")]
    Connection(#[source] BoxError),

    #[error("timed out: {0}")]
    Timeout(#[source] BoxError),

    #[error("HTTP {status}: {source}")]
    Http {
        status: u16,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Other(BoxError),
}

impl Failure {
    pub fn connection(err: impl Into<BoxError>) -> Self {
        Failure::Connection(err.into())
    }

    pub fn timeout(err: impl Into<BoxError>) -> Self {
        Failure::Timeout(err.into())
    }

    pub fn http(status: u16, err: impl Into<BoxError>) -> Self {
        Failure::Http {
            status,
            source: err.into(),
        }
    }

    pub fn other(err: impl Into<BoxError>) -> Self {
        Failure::Other(err.into())
    }

    /// 日志字段 error_type 的取值
    pub fn type_name(&self) -> &'static str {
        match self {
            Failure::Domain(e) => e.kind().name(),
            Failure::Connection(_) => "ConnectionError",
            Failure::Timeout(_) => "TimeoutError",
            Failure::Http { .. } => "HTTPError",
            Failure::Other(_) => "Error",
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Failure::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn as_domain(&self) -> Option<&SurveyError> {
        match self {
            Failure::Domain(e) => Some(e),
            _ => None,
        }
    }
}

/// 连接建立后被对端重置或提前关闭，同样视为连接错误：
/// reqwest 把这类错误报告为 request 错误（无状态码），或在来源链中带有连接类 io::Error
impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Failure::Timeout(Box::new(err))
        } else if let Some(status) = err.status() {
            Failure::Http {
                status: status.as_u16(),
                source: Box::new(err),
            }
        } else if err.is_connect() || err.is_request() || has_connection_io_error(&err) {
            Failure::Connection(Box::new(err))
        } else {
            Failure::Other(Box::new(err))
        }
    }
}

fn is_connection_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;

    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
    )
}

/// 沿 source 链查找连接类 io::Error；响应读到一半遇到 EOF 也算
fn has_connection_io_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = err.source();
    while let Some(cause) = current {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if is_connection_kind(io.kind()) || io.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        current = cause.source();
    }
    false
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Failure::Timeout(Box::new(err)),
            kind if is_connection_kind(kind) => Failure::Connection(Box::new(err)),
            _ => Failure::Other(Box::new(err)),
        }
    }
}

/// async-openai 自身已对 429 / 5xx 做过退避重试；这里只把底层网络错误按类别还原，
/// 其余 API 错误（鉴权、参数、配额）一律视为未知错误，不再重试。
impl From<async_openai::error::OpenAIError> for Failure {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        match err {
            async_openai::error::OpenAIError::Reqwest(e) => Failure::from(e),
            other => Failure::Other(Box::new(other)),
        }
    }
}
