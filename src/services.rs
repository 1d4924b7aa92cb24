//! 服务装配：由 AppConfig 构造共享的熔断器注册表、用量监控、提供方回退与 arXiv 客户端
//!
//! 进程内只装配一次；各组件共享同一个 `Arc<CircuitBreakerRegistry>`。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{CircuitBreakerRegistry, SurveyError};
use crate::llm::{
    ClientFactory, LlmClient, OpenAiCompatibleFactory, ProviderFallback, ProviderRegistry,
    ResilientChat, UsageMonitor,
};
use crate::tools::arxiv::ArxivClient;

pub struct Services {
    pub config: AppConfig,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub usage: Arc<UsageMonitor>,
    pub providers: ProviderFallback,
    pub arxiv: ArxivClient,
}

/// 装配器；默认使用 OpenAI 兼容构造器，测试可替换
pub struct ServicesBuilder {
    config: AppConfig,
    factory: Option<Arc<dyn ClientFactory>>,
}

impl ServicesBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            factory: None,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Services, SurveyError> {
        let config = self.config;
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker_config()));
        let usage = Arc::new(UsageMonitor::open(&config.app.data_dir)?);

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(OpenAiCompatibleFactory::new(config.request_timeout())) as Arc<dyn ClientFactory>
        });
        let registry = ProviderRegistry::new(Arc::new(config.credential_source()));
        let providers = ProviderFallback::new(registry, factory, Arc::clone(&breakers))
            .with_usage(Arc::clone(&usage));

        let arxiv = ArxivClient::new(
            config.search.base_url.clone(),
            config.search_timeout(),
            Arc::clone(&breakers),
        )?;

        tracing::info!(
            data_dir = %config.app.data_dir.display(),
            failure_threshold = config.breaker_config().failure_threshold,
            "Services initialized"
        );

        Ok(Services {
            config,
            breakers,
            usage,
            providers,
            arxiv,
        })
    }
}

impl Services {
    /// 按配置中的首选提供方构造客户端（带回退）
    pub async fn create_client(&self) -> Result<Arc<dyn LlmClient>, SurveyError> {
        let preferred = self.config.preferred_provider().and_then(|id| {
            self.providers
                .registry()
                .available_providers()
                .into_iter()
                .find(|c| c.provider == id)
        });
        self.providers
            .create_client_with_fallback(preferred.as_ref())
            .await
    }

    /// 构造客户端并包装为受保护补全
    pub async fn chat(&self) -> Result<ResilientChat, SurveyError> {
        let client = self.create_client().await?;
        Ok(ResilientChat::new(client, Arc::clone(&self.breakers)).with_usage(Arc::clone(&self.usage)))
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("breakers", &self.breakers)
            .field("usage", &self.usage)
            .field("providers", &self.providers)
            .field("arxiv", &self.arxiv)
            .finish_non_exhaustive()
    }
}
