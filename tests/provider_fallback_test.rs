//! 提供方选择与回退集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use survey_guard::config::AppConfig;
    use survey_guard::core::{CircuitBreakerRegistry, ErrorKind, Failure, SurveyError};
    use survey_guard::llm::{
        Message, MockClientFactory, ProviderFallback, ProviderId, ProviderRegistry,
        StaticCredentials, UsageMonitor,
    };
    use survey_guard::ServicesBuilder;

    fn keys(ids: &[ProviderId]) -> StaticCredentials {
        ids.iter()
            .fold(StaticCredentials::default(), |creds, id| creds.with(id.credential_var(), "test-key"))
    }

    fn fallback(creds: StaticCredentials, factory: &Arc<MockClientFactory>) -> ProviderFallback {
        ProviderFallback::new(
            ProviderRegistry::new(Arc::new(creds)),
            factory.clone(),
            Arc::new(CircuitBreakerRegistry::default()),
        )
    }

    #[tokio::test]
    async fn test_all_providers_fail_reports_attempt_order() {
        let factory = Arc::new(
            MockClientFactory::new()
                .fail(ProviderId::TogetherAi, [Failure::http(401, "invalid key")])
                .fail(ProviderId::Perplexity, [Failure::other("model not found")])
                .fail(ProviderId::OpenAi, [Failure::from(SurveyError::configuration("Missing API key"))]),
        );
        let fb = fallback(
            keys(&[ProviderId::OpenAi, ProviderId::TogetherAi, ProviderId::Perplexity]),
            &factory,
        );

        let err = fb.create_client_with_fallback(None).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AgentCreation);
        assert!(err.message().starts_with("All AI providers failed. Last error:"));
        assert!(err.message().contains("Missing API key"));
        assert_eq!(
            err.context_value("attempted_providers"),
            Some(&serde_json::json!(["together_ai", "perplexity", "openai"]))
        );
        assert_eq!(err.cause_type(), Some("ConfigurationError"));
        assert_eq!(
            factory.attempts(),
            vec![ProviderId::TogetherAi, ProviderId::Perplexity, ProviderId::OpenAi]
        );
    }

    #[tokio::test]
    async fn test_preferred_failure_falls_back_in_priority_order() {
        let factory = Arc::new(
            MockClientFactory::new().fail(ProviderId::OpenAi, [Failure::http(403, "forbidden")]),
        );
        let fb = fallback(keys(&ProviderId::ALL), &factory);
        let preferred = fb
            .registry()
            .available_providers()
            .into_iter()
            .find(|c| c.provider == ProviderId::OpenAi)
            .unwrap();

        let client = fb.create_client_with_fallback(Some(&preferred)).await.unwrap();
        assert_eq!(client.provider(), ProviderId::TogetherAi);
        assert_eq!(factory.attempts(), vec![ProviderId::OpenAi, ProviderId::TogetherAi]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_within_provider() {
        let factory = Arc::new(
            MockClientFactory::new().fail(ProviderId::Gemini, [Failure::connection("reset by peer")]),
        );
        let fb = fallback(keys(&[ProviderId::Gemini, ProviderId::OpenAi]), &factory);

        let client = fb.create_client_with_fallback(None).await.unwrap();
        assert_eq!(client.provider(), ProviderId::Gemini);
        assert_eq!(factory.attempts(), vec![ProviderId::Gemini, ProviderId::Gemini]);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_to_next_provider() {
        let factory = Arc::new(MockClientFactory::new());
        let fb = fallback(keys(&[ProviderId::TogetherAi, ProviderId::Gemini]), &factory);
        for _ in 0..5 {
            fb.breakers().record("LLM:together_ai", false);
        }

        let client = fb.create_client_with_fallback(None).await.unwrap();
        assert_eq!(client.provider(), ProviderId::Gemini);
        // 打开的熔断器下不调用构造器
        assert_eq!(factory.attempts(), vec![ProviderId::Gemini]);
    }

    #[tokio::test]
    async fn test_services_chat_records_usage() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = dir.path().to_path_buf();
        cfg.secrets
            .insert("TOGETHER_AI_API_KEY".to_string(), "together-key".to_string());

        let services = ServicesBuilder::new(cfg)
            .with_factory(Arc::new(MockClientFactory::new()))
            .build()
            .unwrap();

        let chat = services.chat().await.unwrap();
        assert_eq!(chat.client().provider(), ProviderId::TogetherAi);
        let completion = chat.complete(&[Message::user("find surveys")]).await.unwrap();
        assert!(completion.content.contains("find surveys"));

        let info = services.providers.provider_info();
        assert_eq!(info.best_provider.as_deref(), Some("together_ai"));
        assert_eq!(info.total_usage.total_requests, 1);
        let together = info.providers.iter().find(|p| p.name == "together_ai").unwrap();
        assert_eq!(together.usage_stats.totals.successful_requests, 1);

        // 新进程加载同一目录可看到持久化的记录
        let reopened = UsageMonitor::open(dir.path()).unwrap();
        assert_eq!(reopened.records().len(), 1);
    }
}
