//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SURVEY__*` 覆盖（双下划线表示嵌套，如 `SURVEY__CIRCUIT__FAILURE_THRESHOLD=3`）。
//! 提供方凭据不走这里的前缀：进程环境变量（如 `OPENAI_API_KEY`）优先，其次是 `[secrets]` 段。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::BreakerConfig;
use crate::llm::{CredentialChain, EnvCredentials, ProviderId, StaticCredentials};
use crate::observability::redact_display;
use crate::tools::arxiv::{ARXIV_API_URL, MAX_ARXIV_RESULTS};

/// 默认检索论文数
pub const DEFAULT_MAX_PAPERS: u32 = 5;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub search: SearchSection,
    pub circuit: CircuitSection,
    pub llm: LlmSection,
    /// 部署环境的密钥存储（第二凭据来源）
    pub secrets: HashMap<String, String>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 用量数据目录（usage_data.json 所在）
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "survey-guard".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// [search] 段：arXiv 端点、超时、默认论文数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_papers: u32,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            base_url: ARXIV_API_URL.to_string(),
            timeout_secs: 30,
            max_papers: DEFAULT_MAX_PAPERS,
        }
    }
}

/// [circuit] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout_secs: defaults.recovery_timeout.as_secs(),
        }
    }
}

/// [llm] 段：首选提供方与请求超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub preferred_provider: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            preferred_provider: None,
            request_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    /// 熔断参数；阈值 0 按 1 处理
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(self.circuit.recovery_timeout_secs),
        }
    }

    /// 凭据链：进程环境变量 → [secrets]（键名不区分大小写）
    pub fn credential_source(&self) -> CredentialChain {
        let secrets = self
            .secrets
            .iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v.clone()))
            .collect();
        CredentialChain::new()
            .push(EnvCredentials)
            .push(StaticCredentials::new(secrets))
    }

    /// 默认论文数：环境变量 MAX_PAPERS 优先（无法解析时忽略），结果截断到 [1, 50]
    pub fn max_papers(&self) -> u32 {
        let from_env = std::env::var("MAX_PAPERS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok());
        from_env
            .unwrap_or(self.search.max_papers)
            .clamp(1, MAX_ARXIV_RESULTS)
    }

    pub fn preferred_provider(&self) -> Option<ProviderId> {
        let name = self.llm.preferred_provider.as_deref()?;
        match name.parse() {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(provider = name, error = %redact_display(&err), "Ignoring unknown preferred provider");
                None
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search.timeout_secs)
    }
}

/// 从 config 目录加载配置，环境变量 SURVEY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SURVEY__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SURVEY")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CredentialSource;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.search.max_papers, 5);
        assert_eq!(cfg.search.base_url, "https://export.arxiv.org/api/query");
        assert_eq!(cfg.breaker_config(), BreakerConfig::default());
        assert_eq!(cfg.request_timeout(), Duration::from_secs(60));
        assert!(cfg.preferred_provider().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[app]
data_dir = "/tmp/survey"

[circuit]
failure_threshold = 3
recovery_timeout_secs = 60

[llm]
preferred_provider = "gemini"

[secrets]
GEMINI_API_KEY = "from-file"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.app.data_dir, PathBuf::from("/tmp/survey"));
        assert_eq!(cfg.breaker_config().failure_threshold, 3);
        assert_eq!(cfg.breaker_config().recovery_timeout, Duration::from_secs(60));
        assert_eq!(cfg.preferred_provider(), Some(ProviderId::Gemini));
        // 未设置的段保持默认
        assert_eq!(cfg.search.timeout_secs, 30);
    }

    #[test]
    fn test_secrets_are_case_insensitive() {
        let mut cfg = AppConfig::default();
        cfg.secrets
            .insert("perplexity_test_only_key".to_string(), " secret ".to_string());
        let chain = cfg.credential_source();
        assert_eq!(chain.resolve("PERPLEXITY_TEST_ONLY_KEY").as_deref(), Some("secret"));
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let mut cfg = AppConfig::default();
        cfg.circuit.failure_threshold = 0;
        assert_eq!(cfg.breaker_config().failure_threshold, 1);
    }

    #[test]
    fn test_unknown_preferred_provider_ignored() {
        let mut cfg = AppConfig::default();
        cfg.llm.preferred_provider = Some("claude".to_string());
        assert!(cfg.preferred_provider().is_none());
    }
}
