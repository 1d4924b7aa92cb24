//! 提供方回退编排
//!
//! 按优先级（或调用方指定的首选）逐个尝试构造客户端；每次构造都经 language-model 策略保护，
//! 熔断键按提供方区分（`LLM:<provider>`），一个提供方连续失败不会阻断其余提供方。
//! 全部失败时返回 AgentCreation 错误，context 中列出按尝试顺序的提供方。

use std::sync::Arc;

use serde::Serialize;

use crate::core::{CircuitBreakerRegistry, ErrorKind, GuardedCall, RetryPolicy, SurveyError};
use crate::llm::usage::{ProviderStats, UsageMonitor, UsageTotals};
use crate::llm::{ClientFactory, LlmClient, ProviderConfig, ProviderRegistry};
use crate::observability::{log_error_with_details, redact_display};

pub const NO_PROVIDERS_ERROR: &str =
    "No AI providers are available. Please configure at least one API key.";

const COMPONENT: &str = "llm_factory";

pub struct ProviderFallback {
    registry: ProviderRegistry,
    factory: Arc<dyn ClientFactory>,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
    usage: Option<Arc<UsageMonitor>>,
}

impl ProviderFallback {
    pub fn new(
        registry: ProviderRegistry,
        factory: Arc<dyn ClientFactory>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            registry,
            factory,
            breakers,
            policy: RetryPolicy::language_model(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Arc<UsageMonitor>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// 替换构造时使用的重试策略（熔断键仍按提供方派生）
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn usage(&self) -> Option<&Arc<UsageMonitor>> {
        self.usage.as_ref()
    }

    fn no_providers() -> SurveyError {
        SurveyError::configuration(NO_PROVIDERS_ERROR)
            .with_user_message(NO_PROVIDERS_ERROR)
            .with_context("available_providers", "none")
    }

    /// 单个提供方构造；`None` 时取最优可用提供方
    pub async fn create_client(
        &self,
        config: Option<&ProviderConfig>,
    ) -> Result<Arc<dyn LlmClient>, SurveyError> {
        let best;
        let config = match config {
            Some(config) => config,
            None => {
                best = self.registry.best_available_provider().ok_or_else(Self::no_providers)?;
                &best
            }
        };

        tracing::info!(
            component = COMPONENT,
            provider = %config.provider,
            model = %config.model,
            "Creating LLM client for {}",
            config.provider
        );

        let guard = GuardedCall::new(
            self.policy.for_service(config.breaker_key()),
            Arc::clone(&self.breakers),
        );
        let factory = &self.factory;
        match guard
            .execute("create_llm_client", || factory.construct(config))
            .await
        {
            Ok(client) => {
                tracing::info!(
                    component = COMPONENT,
                    provider = %config.provider,
                    model = %config.model,
                    "LLM client created successfully for {}",
                    config.provider
                );
                Ok(client)
            }
            Err(err) if err.kind() == ErrorKind::Configuration => Err(err),
            Err(err) => {
                log_error_with_details(&err, "create_llm_client", COMPONENT);
                let cause_type = err.kind().name();
                Err(SurveyError::agent_creation(format!(
                    "Failed to create LLM client for {}: {}",
                    config.provider, err
                ))
                .with_context("provider", config.provider.as_str())
                .with_context("model", config.model.as_str())
                .with_boxed_source(Box::new(err), cause_type))
            }
        }
    }

    /// 带回退的构造：首选提供方（若可用）排到最前，其余按优先级
    pub async fn create_client_with_fallback(
        &self,
        preferred: Option<&ProviderConfig>,
    ) -> Result<Arc<dyn LlmClient>, SurveyError> {
        let mut candidates = self.registry.available_providers();
        if candidates.is_empty() {
            return Err(Self::no_providers());
        }

        if let Some(preferred) = preferred {
            if let Some(pos) = candidates.iter().position(|c| c.provider == preferred.provider) {
                let chosen = candidates.remove(pos);
                candidates.insert(0, chosen);
            }
        }

        let mut last_error: Option<SurveyError> = None;
        for candidate in &candidates {
            tracing::info!(
                component = COMPONENT,
                provider = %candidate.provider,
                model = %candidate.model,
                "Attempting to create LLM client for {}",
                candidate.provider
            );
            match self.create_client(Some(candidate)).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    let detail = redact_display(&err);
                    tracing::warn!(
                        component = COMPONENT,
                        provider = %candidate.provider,
                        model = %candidate.model,
                        error = %detail,
                        "Failed to create LLM client for {}: {}",
                        candidate.provider,
                        detail
                    );
                    last_error = Some(err);
                }
            }
        }

        let attempted: Vec<&str> = candidates.iter().map(|c| c.provider.as_str()).collect();
        let last_message = last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            component = COMPONENT,
            attempted_providers = ?attempted,
            last_error = %redact_display(&last_message),
            "All AI providers failed to create LLM clients"
        );

        let err = SurveyError::agent_creation(format!("All AI providers failed. Last error: {last_message}"))
            .with_context("model", "unknown")
            .with_context("attempted_providers", attempted);
        Err(match last_error {
            Some(last) => {
                let cause_type = last.kind().name();
                err.with_boxed_source(Box::new(last), cause_type)
            }
            None => err,
        })
    }

    /// 可用提供方概览（含用量统计）
    pub fn provider_info(&self) -> ProviderInfo {
        let available = self.registry.available_providers();
        let stats = self
            .usage
            .as_ref()
            .map(|u| u.provider_stats(None))
            .unwrap_or_default();
        let total_usage = self
            .usage
            .as_ref()
            .map(|u| u.total_usage())
            .unwrap_or_default();

        let providers = available
            .iter()
            .map(|config| {
                let usage_stats = stats
                    .iter()
                    .find(|s| s.provider == config.provider.as_str())
                    .cloned()
                    .unwrap_or_else(|| ProviderStats {
                        provider: config.provider.as_str().to_string(),
                        totals: UsageTotals::default(),
                        last_used: None,
                    });
                ProviderSummary {
                    name: config.provider.as_str().to_string(),
                    model: config.model.clone(),
                    priority: config.priority,
                    free_tier_rpm: config.rate_limit.requests_per_minute,
                    free_tier_tpm: config.rate_limit.tokens_per_minute,
                    usage_stats,
                }
            })
            .collect();

        ProviderInfo {
            available_count: available.len(),
            best_provider: available.first().map(|c| c.provider.as_str().to_string()),
            providers,
            total_usage,
        }
    }
}

impl std::fmt::Debug for ProviderFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFallback")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub model: String,
    pub priority: u32,
    pub free_tier_rpm: u32,
    pub free_tier_tpm: u32,
    pub usage_stats: ProviderStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub available_count: usize,
    pub providers: Vec<ProviderSummary>,
    pub best_provider: Option<String>,
    pub total_usage: UsageTotals,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BreakerConfig, Failure};
    use crate::llm::{MockClientFactory, ProviderId, StaticCredentials};

    fn fallback(creds: StaticCredentials, factory: MockClientFactory) -> (ProviderFallback, Arc<MockClientFactory>) {
        let factory = Arc::new(factory);
        let fb = ProviderFallback::new(
            ProviderRegistry::new(Arc::new(creds)),
            factory.clone(),
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
        );
        (fb, factory)
    }

    fn all_keys() -> StaticCredentials {
        StaticCredentials::default()
            .with("TOGETHER_AI_API_KEY", "t")
            .with("GEMINI_API_KEY", "g")
            .with("PERPLEXITY_API_KEY", "p")
            .with("OPENAI_API_KEY", "o")
    }

    #[tokio::test]
    async fn test_no_providers_is_configuration_error() {
        let (fb, factory) = fallback(StaticCredentials::default(), MockClientFactory::new());
        let err = fb.create_client_with_fallback(None).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.message(), NO_PROVIDERS_ERROR);
        assert!(factory.attempts().is_empty());

        let err = fb.create_client(None).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_first_priority_wins() {
        let (fb, factory) = fallback(all_keys(), MockClientFactory::new());
        let client = fb.create_client_with_fallback(None).await.unwrap();
        assert_eq!(client.provider(), ProviderId::TogetherAi);
        assert_eq!(factory.attempts(), vec![ProviderId::TogetherAi]);
    }

    #[tokio::test]
    async fn test_preferred_moves_to_front() {
        let (fb, factory) = fallback(all_keys(), MockClientFactory::new());
        let preferred = fb.registry().available_providers()[3].clone();
        let client = fb.create_client_with_fallback(Some(&preferred)).await.unwrap();
        assert_eq!(client.provider(), ProviderId::OpenAi);
        assert_eq!(factory.attempts(), vec![ProviderId::OpenAi]);
    }

    #[tokio::test]
    async fn test_unavailable_preferred_is_ignored() {
        let creds = StaticCredentials::default().with("GEMINI_API_KEY", "g");
        let (fb, _) = fallback(creds, MockClientFactory::new());
        let preferred = crate::llm::default_provider_table().remove(0);
        let client = fb.create_client_with_fallback(Some(&preferred)).await.unwrap();
        assert_eq!(client.provider(), ProviderId::Gemini);
    }

    #[tokio::test]
    async fn test_falls_through_non_retryable_failures() {
        let factory = MockClientFactory::new()
            .fail(ProviderId::TogetherAi, [Failure::http(401, "unauthorized")])
            .fail(ProviderId::Gemini, [Failure::from(SurveyError::configuration("bad model"))]);
        let (fb, factory) = fallback(all_keys(), factory);

        let client = fb.create_client_with_fallback(None).await.unwrap();
        assert_eq!(client.provider(), ProviderId::Perplexity);
        assert_eq!(
            factory.attempts(),
            vec![ProviderId::TogetherAi, ProviderId::Gemini, ProviderId::Perplexity]
        );
        // 失败各自计入该提供方的熔断键，配置错误同样计数
        assert_eq!(fb.breakers().state("LLM:together_ai").failure_count, 1);
        assert_eq!(fb.breakers().state("LLM:gemini").failure_count, 1);
        assert_eq!(fb.breakers().state("LLM:perplexity").failure_count, 0);
        assert_eq!(fb.breakers().state("LLM").failure_count, 0);
    }

    #[tokio::test]
    async fn test_fallback_logs_are_redacted() {
        let (logs, _guard) = crate::observability::capture::logs();
        let factory = MockClientFactory::new()
            .fail(ProviderId::OpenAi, [Failure::http(401, "invalid api_key=sk-proj-LEAKED0987654321")]);
        let creds = StaticCredentials::default().with("OPENAI_API_KEY", "o");
        let (fb, _) = fallback(creds, factory);

        let err = fb.create_client_with_fallback(None).await.err().unwrap();
        assert!(err.message().starts_with("All AI providers failed"));

        let out = logs.contents();
        assert!(out.contains("Failed to create LLM client for openai"));
        assert!(out.contains("All AI providers failed to create LLM clients"));
        assert!(!out.contains("LEAKED0987654321"));
    }

    #[tokio::test]
    async fn test_create_client_wraps_in_agent_creation() {
        let factory = MockClientFactory::new().fail(ProviderId::OpenAi, [Failure::other("boom")]);
        let creds = StaticCredentials::default().with("OPENAI_API_KEY", "o");
        let (fb, _) = fallback(creds, factory);

        let err = fb.create_client(None).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AgentCreation);
        assert!(err.message().starts_with("Failed to create LLM client for openai"));
        assert_eq!(err.context_value("provider"), Some(&serde_json::json!("openai")));
        assert_eq!(err.context_value("model"), Some(&serde_json::json!("gpt-4o-mini")));
        assert_eq!(err.cause_type(), Some("LLMError"));
    }

    #[tokio::test]
    async fn test_create_client_passes_configuration_through() {
        let factory = MockClientFactory::new()
            .fail(ProviderId::OpenAi, [Failure::from(SurveyError::configuration("Missing API key"))]);
        let creds = StaticCredentials::default().with("OPENAI_API_KEY", "o");
        let (fb, _) = fallback(creds, factory);

        let err = fb.create_client(None).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.message(), "Missing API key");
    }

    #[test]
    fn test_provider_info_without_usage() {
        let (fb, _) = fallback(
            StaticCredentials::default().with("PERPLEXITY_API_KEY", "p"),
            MockClientFactory::new(),
        );
        let info = fb.provider_info();
        assert_eq!(info.available_count, 1);
        assert_eq!(info.best_provider.as_deref(), Some("perplexity"));
        assert_eq!(info.providers[0].free_tier_rpm, 5);
        assert_eq!(info.providers[0].free_tier_tpm, 100_000);
        assert_eq!(info.providers[0].usage_stats.totals.total_requests, 0);
        assert_eq!(info.total_usage, UsageTotals::default());
    }
}
