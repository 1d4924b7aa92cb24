//! 领域错误分类与用户可读消息
//!
//! 与 classify / GuardedCall 配合：Validation、Configuration 属于调用方错误，原样透传不重试；
//! ExternalService / LanguageModel / Export 属于环境瞬时错误，按策略重试后包装为单一领域错误；
//! AgentCreation / Orchestration 为终态聚合错误。

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// 可跨线程传递的装箱错误（原始原因）
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 上下文中的「禁止重试」约定键：实为校验失败的外部服务错误会设置它
pub const NO_RETRY_KEY: &str = "no_retry";

/// 错误种类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    ExternalService,
    LanguageModel,
    Validation,
    Export,
    AgentCreation,
    Orchestration,
}

impl ErrorKind {
    /// 日志与详情记录中使用的类型名
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::ExternalService => "ExternalServiceError",
            ErrorKind::LanguageModel => "LLMError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Export => "ExportError",
            ErrorKind::AgentCreation => "AgentCreationError",
            ErrorKind::Orchestration => "OrchestrationError",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::Validation => Severity::Info,
            ErrorKind::ExternalService | ErrorKind::LanguageModel | ErrorKind::Export => {
                Severity::Warning
            }
            ErrorKind::Configuration | ErrorKind::AgentCreation | ErrorKind::Orchestration => {
                Severity::Error
            }
        }
    }

    /// 默认的用户可见消息（可直接展示，不含敏感信息）
    pub fn default_user_message(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => {
                "The application is not configured correctly. Please check your settings and try again."
            }
            ErrorKind::ExternalService => {
                "An external service is temporarily unavailable. Please try again in a few moments."
            }
            ErrorKind::LanguageModel => {
                "The AI model service is temporarily unavailable. Please try again in a few moments."
            }
            ErrorKind::Validation => "The provided input is invalid. Please review it and try again.",
            ErrorKind::Export => "Exporting the results failed. Please try again.",
            ErrorKind::AgentCreation => {
                "Could not start the AI assistants. Please check your API keys and try again."
            }
            ErrorKind::Orchestration => {
                "The review process was interrupted. Please try again."
            }
        }
    }

    /// 调用方错误：永不重试、永不包装
    pub fn is_caller_mistake(&self) -> bool {
        matches!(self, ErrorKind::Validation | ErrorKind::Configuration)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// 领域错误：开发者消息 + 用户消息 + 严重级别 + 上下文 + 原始原因 + 唯一 ID + 时间戳
///
/// 构造永不失败；上下文在日志边界（observability::redact）统一脱敏，本类型不做过滤。
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SurveyError {
    kind: ErrorKind,
    message: String,
    user_message: String,
    severity: Severity,
    context: BTreeMap<String, Value>,
    #[source]
    source: Option<BoxError>,
    cause_type: Option<String>,
    id: String,
    timestamp: DateTime<Utc>,
}

impl SurveyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            user_message: kind.default_user_message().to_string(),
            severity: kind.default_severity(),
            context: BTreeMap::new(),
            source: None,
            cause_type: None,
            id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// 校验错误：消息本身即用户安全的，直接作为用户消息
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        let err = Self::new(ErrorKind::Validation, message.clone());
        err.with_user_message(message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn external_service(service: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService, message).with_context("service", service)
    }

    pub fn language_model(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LanguageModel, message)
    }

    pub fn export(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Export, message)
    }

    pub fn agent_creation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AgentCreation, message)
    }

    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Orchestration, message)
    }

    /// 覆盖用户消息；空字符串被忽略以保证用户消息始终非空
    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        let user_message = user_message.into();
        if !user_message.trim().is_empty() {
            self.user_message = user_message;
        }
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// 包装原始原因，并记录其类型名（取路径最后一段）
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause_type = Some(short_type_name(std::any::type_name::<E>()).to_string());
        self.source = Some(Box::new(source));
        self
    }

    /// 包装已装箱的原因；类型名由调用方给出（装箱后无法再取得具体类型）
    pub fn with_boxed_source(mut self, source: BoxError, cause_type: impl Into<String>) -> Self {
        self.cause_type = Some(cause_type.into());
        self.source = Some(source);
        self
    }

    /// 标记为不可重试（context 中写入 `no_retry: true`）
    pub fn no_retry(self) -> Self {
        self.with_context(NO_RETRY_KEY, true)
    }

    pub fn is_no_retry(&self) -> bool {
        matches!(self.context.get(NO_RETRY_KEY), Some(Value::Bool(true)))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    pub fn cause_type(&self) -> Option<&str> {
        self.cause_type.as_deref()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// 提取结构化详情，供日志记录使用
    pub fn details(&self) -> ErrorDetails {
        ErrorDetails {
            error_type: self.kind.name(),
            message: self.message.clone(),
            user_message: self.user_message.clone(),
            severity: self.severity,
            context: self.context.clone(),
            cause_type: self.cause_type.clone(),
            error_id: self.id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// 错误详情记录（日志用）
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetails {
    pub error_type: &'static str,
    pub message: String,
    pub user_message: String,
    pub severity: Severity,
    pub context: BTreeMap<String, Value>,
    pub cause_type: Option<String>,
    pub error_id: String,
    pub timestamp: DateTime<Utc>,
}

pub const MSG_CONNECTION: &str =
    "Unable to connect to the service. Please check your internet connection and try again.";
pub const MSG_TIMEOUT: &str = "The request timed out. Please try again.";
pub const MSG_MISSING_KEY: &str =
    "A required configuration value is missing. Please check your settings.";
pub const MSG_FILE_NOT_FOUND: &str = "The requested file could not be found.";
pub const MSG_PERMISSION: &str = "Permission denied. Please check file and folder permissions.";
pub const MSG_UNEXPECTED: &str = "An unexpected error occurred. Please try again.";

/// 将任意错误映射为用户可读消息：领域错误直接返回其 user_message，
/// 其余按 原因链 中首个可识别的错误类型查表，无法识别时返回通用消息。
pub fn user_friendly_message(err: &(dyn StdError + 'static)) -> String {
    if let Some(survey) = err.downcast_ref::<SurveyError>() {
        return survey.user_message().to_string();
    }

    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(msg) = known_message(e) {
            return msg.to_string();
        }
        current = e.source();
    }
    MSG_UNEXPECTED.to_string()
}

fn known_message(err: &(dyn StdError + 'static)) -> Option<&'static str> {
    use std::io::ErrorKind as IoKind;

    if let Some(failure) = err.downcast_ref::<crate::core::Failure>() {
        return match failure {
            crate::core::Failure::Connection(_) => Some(MSG_CONNECTION),
            crate::core::Failure::Timeout(_) => Some(MSG_TIMEOUT),
            crate::core::Failure::Domain(e) => Some(e.kind().default_user_message()),
            _ => None,
        };
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return match io.kind() {
            IoKind::NotFound => Some(MSG_FILE_NOT_FOUND),
            IoKind::PermissionDenied => Some(MSG_PERMISSION),
            IoKind::TimedOut => Some(MSG_TIMEOUT),
            IoKind::ConnectionRefused
            | IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::NotConnected => Some(MSG_CONNECTION),
            _ => None,
        };
    }
    if let Some(req) = err.downcast_ref::<reqwest::Error>() {
        if req.is_timeout() {
            return Some(MSG_TIMEOUT);
        }
        if req.is_connect() {
            return Some(MSG_CONNECTION);
        }
        return None;
    }
    if let Some(std::env::VarError::NotPresent) = err.downcast_ref::<std::env::VarError>() {
        return Some(MSG_MISSING_KEY);
    }
    None
}

fn short_type_name(full: &str) -> &str {
    // 泛型参数中也可能含 "::"，只看尖括号之前的部分
    let head = full.split('<').next().unwrap_or(full);
    head.rsplit("::").next().unwrap_or(head)
}
