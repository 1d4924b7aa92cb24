//! 提供方注册表与选择
//!
//! 固定优先级表（数字越小越优先）；某提供方「可用」当且仅当能解析出非空凭据。
//! 凭据与模型名按 CredentialSource 链解析：进程环境变量优先，其次配置文件中的 secrets。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::SurveyError;

/// 支持的提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    TogetherAi,
    Gemini,
    Perplexity,
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderId {
    pub const ALL: [ProviderId; 4] = [
        ProviderId::TogetherAi,
        ProviderId::Gemini,
        ProviderId::Perplexity,
        ProviderId::OpenAi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::TogetherAi => "together_ai",
            ProviderId::Gemini => "gemini",
            ProviderId::Perplexity => "perplexity",
            ProviderId::OpenAi => "openai",
        }
    }

    /// 凭据变量名
    pub fn credential_var(&self) -> &'static str {
        match self {
            ProviderId::TogetherAi => "TOGETHER_AI_API_KEY",
            ProviderId::Gemini => "GEMINI_API_KEY",
            ProviderId::Perplexity => "PERPLEXITY_API_KEY",
            ProviderId::OpenAi => "OPENAI_API_KEY",
        }
    }

    /// 模型覆盖变量名
    pub fn model_var(&self) -> &'static str {
        match self {
            ProviderId::TogetherAi => "TOGETHER_AI_MODEL",
            ProviderId::Gemini => "GEMINI_MODEL",
            ProviderId::Perplexity => "PERPLEXITY_MODEL",
            ProviderId::OpenAi => "OPENAI_MODEL",
        }
    }

    /// OpenAI 兼容端点；None 表示 async_openai 默认地址
    pub fn base_url(&self) -> Option<&'static str> {
        match self {
            ProviderId::TogetherAi => Some("https://api.together.xyz/v1"),
            ProviderId::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
            ProviderId::Perplexity => Some("https://api.perplexity.ai"),
            ProviderId::OpenAi => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = SurveyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| {
                SurveyError::validation(format!("Unknown AI provider: {}", s.trim()))
                    .with_context("provider", s.trim())
            })
    }
}

/// 免费额度限速
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

/// 单个提供方配置；覆盖通过按值复制的 builder 完成
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider: ProviderId,
    pub api_key: Option<String>,
    pub model: String,
    pub priority: u32,
    pub rate_limit: RateLimit,
}

impl ProviderConfig {
    pub fn new(provider: ProviderId, model: impl Into<String>, priority: u32, rate_limit: RateLimit) -> Self {
        Self {
            provider,
            api_key: None,
            model: model.into(),
            priority,
            rate_limit,
        }
    }

    pub fn with_api_key(&self, api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..self.clone()
        }
    }

    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// 熔断键：每个提供方独立计数
    pub fn breaker_key(&self) -> String {
        format!("{}:{}", crate::core::LLM_SERVICE, self.provider)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| crate::observability::REDACTED))
            .field("model", &self.model)
            .field("priority", &self.priority)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

/// 默认优先级表：按免费额度排序
pub fn default_provider_table() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new(
            ProviderId::TogetherAi,
            "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo",
            1,
            RateLimit {
                requests_per_minute: 60,
                tokens_per_minute: 60_000,
            },
        ),
        ProviderConfig::new(
            ProviderId::Gemini,
            "gemini-2.5-flash",
            2,
            RateLimit {
                requests_per_minute: 5,
                tokens_per_minute: 250_000,
            },
        ),
        ProviderConfig::new(
            ProviderId::Perplexity,
            "llama-3.1-sonar-large-128k-online",
            3,
            RateLimit {
                requests_per_minute: 5,
                tokens_per_minute: 100_000,
            },
        ),
        ProviderConfig::new(
            ProviderId::OpenAi,
            "gpt-4o-mini",
            4,
            RateLimit {
                requests_per_minute: 3,
                tokens_per_minute: 40_000,
            },
        ),
    ]
}

/// 命名值来源（凭据、模型覆盖等）
pub trait CredentialSource: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 进程环境变量
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn resolve(&self, name: &str) -> Option<String> {
        non_empty(std::env::var(name).ok())
    }
}

/// 固定键值表（配置文件 [secrets] 或测试）
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn resolve(&self, name: &str) -> Option<String> {
        non_empty(self.values.get(name).cloned())
    }
}

/// 按顺序查询多个来源，首个非空值胜出
#[derive(Clone, Default)]
pub struct CredentialChain {
    sources: Vec<Arc<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }
}

impl CredentialSource for CredentialChain {
    fn resolve(&self, name: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.resolve(name))
    }
}

/// 提供方注册表：优先级表 + 凭据来源
#[derive(Clone)]
pub struct ProviderRegistry {
    table: Vec<ProviderConfig>,
    credentials: Arc<dyn CredentialSource>,
}

impl ProviderRegistry {
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self::with_table(default_provider_table(), credentials)
    }

    pub fn with_table(table: Vec<ProviderConfig>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self { table, credentials }
    }

    /// 模型名：覆盖变量优先，否则表中默认值
    pub fn model_for(&self, provider: ProviderId) -> Option<String> {
        self.credentials.resolve(provider.model_var()).or_else(|| {
            self.table
                .iter()
                .find(|c| c.provider == provider)
                .map(|c| c.model.clone())
        })
    }

    /// 有凭据的提供方，按优先级升序；每次调用都重新解析凭据
    pub fn available_providers(&self) -> Vec<ProviderConfig> {
        let mut available: Vec<ProviderConfig> = self
            .table
            .iter()
            .filter_map(|entry| {
                let key = self.credentials.resolve(entry.provider.credential_var())?;
                let model = self
                    .credentials
                    .resolve(entry.provider.model_var())
                    .unwrap_or_else(|| entry.model.clone());
                Some(entry.with_api_key(key).with_model(model))
            })
            .collect();
        available.sort_by_key(|c| c.priority);
        available
    }

    pub fn best_available_provider(&self) -> Option<ProviderConfig> {
        self.available_providers().into_iter().next()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(creds: StaticCredentials) -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(creds))
    }

    #[test]
    fn test_provider_id_names() {
        assert_eq!(ProviderId::TogetherAi.to_string(), "together_ai");
        assert_eq!("OpenAI".parse::<ProviderId>().unwrap(), ProviderId::OpenAi);
        assert_eq!(" gemini ".parse::<ProviderId>().unwrap(), ProviderId::Gemini);
        assert!("claude".parse::<ProviderId>().is_err());
        assert_eq!(serde_json::to_string(&ProviderId::OpenAi).unwrap(), "\"openai\"");
        assert_eq!(serde_json::to_string(&ProviderId::TogetherAi).unwrap(), "\"together_ai\"");
    }

    #[test]
    fn test_no_credentials_no_providers() {
        let reg = registry(StaticCredentials::default());
        assert!(reg.available_providers().is_empty());
        assert!(reg.best_available_provider().is_none());
    }

    #[test]
    fn test_available_sorted_by_priority() {
        let reg = registry(
            StaticCredentials::default()
                .with("OPENAI_API_KEY", "sk-openai")
                .with("GEMINI_API_KEY", "g-key"),
        );
        let ids: Vec<_> = reg.available_providers().iter().map(|c| c.provider).collect();
        assert_eq!(ids, vec![ProviderId::Gemini, ProviderId::OpenAi]);
        assert_eq!(reg.best_available_provider().unwrap().provider, ProviderId::Gemini);
    }

    #[test]
    fn test_blank_credential_excluded() {
        let reg = registry(
            StaticCredentials::default()
                .with("TOGETHER_AI_API_KEY", "   ")
                .with("PERPLEXITY_API_KEY", "  pplx-key  "),
        );
        let available = reg.available_providers();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].provider, ProviderId::Perplexity);
        assert_eq!(available[0].api_key.as_deref(), Some("pplx-key"));
    }

    #[test]
    fn test_model_override() {
        let reg = registry(
            StaticCredentials::default()
                .with("OPENAI_API_KEY", "sk-openai")
                .with("OPENAI_MODEL", "gpt-4o"),
        );
        assert_eq!(reg.available_providers()[0].model, "gpt-4o");
        assert_eq!(reg.model_for(ProviderId::OpenAi).as_deref(), Some("gpt-4o"));
        assert_eq!(reg.model_for(ProviderId::Gemini).as_deref(), Some("gemini-2.5-flash"));
    }

    #[test]
    fn test_credential_chain_first_non_empty_wins() {
        let chain = CredentialChain::new()
            .push(StaticCredentials::default().with("GEMINI_API_KEY", ""))
            .push(StaticCredentials::default().with("GEMINI_API_KEY", "from-secrets"))
            .push(StaticCredentials::default().with("GEMINI_API_KEY", "ignored"));
        assert_eq!(chain.resolve("GEMINI_API_KEY").as_deref(), Some("from-secrets"));
        assert_eq!(chain.resolve("MISSING"), None);
    }

    #[test]
    fn test_builders_copy_by_value() {
        let base = default_provider_table().remove(0);
        let keyed = base.with_api_key("k").with_model("m");
        assert!(base.api_key.is_none());
        assert_eq!(base.model, "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo");
        assert_eq!(keyed.model, "m");
        assert!(keyed.has_credential());
        assert_eq!(keyed.breaker_key(), "LLM:together_ai");
    }

    #[test]
    fn test_debug_redacts_key() {
        let cfg = default_provider_table().remove(3).with_api_key("sk-very-secret");
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
