//! OpenAI 兼容 API 客户端
//!
//! 四个提供方都暴露 OpenAI 兼容端点，只是 base_url 不同；统一通过 async_openai 调用。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::{Failure, SurveyError};
use crate::llm::{ClientFactory, Completion, LlmClient, Message, ProviderConfig, ProviderId, Role};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Token 使用统计（累计值，多个克隆共享计数）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    prompt_tokens: Arc<AtomicU64>,
    completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.prompt_tokens.load(Ordering::Relaxed);
        let completion = self.completion_tokens.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    provider: ProviderId,
    model: String,
    timeout: Duration,
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(provider: ProviderId, api_key: &str, model: &str, timeout: Duration) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = provider.base_url() {
            config = config.with_api_base(url);
        }

        Self {
            client: Client::with_config(config),
            provider,
            model: model.to_string(),
            timeout,
            usage: TokenUsage::default(),
        }
    }

    fn to_request_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        messages
            .iter()
            .map(|m| {
                let content = m.content.clone();
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(content)
                            .build()?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(content)
                            .build()?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(content)
                            .build()?,
                    ),
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, Failure> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_request_messages(messages)?)
            .build()?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| {
                Failure::timeout(format!(
                    "{} request timed out after {}s",
                    self.provider,
                    self.timeout.as_secs()
                ))
            })??;

        let (input_tokens, output_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u64::from(u.prompt_tokens), u64::from(u.completion_tokens)))
            .unwrap_or_default();
        self.usage.add(input_tokens, output_tokens);

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Completion {
            content,
            input_tokens,
            output_tokens,
        })
    }

    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

/// 默认构造器：校验凭据与模型后构造 OpenAiClient（构造本身不发网络请求）
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleFactory {
    timeout: Duration,
}

impl OpenAiCompatibleFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for OpenAiCompatibleFactory {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl ClientFactory for OpenAiCompatibleFactory {
    async fn construct(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmClient>, Failure> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                SurveyError::configuration(format!("Missing API key for {}", config.provider))
                    .with_context("provider", config.provider.as_str())
                    .with_context("credential_var", config.provider.credential_var())
            })?;

        if config.model.trim().is_empty() {
            return Err(SurveyError::configuration(format!(
                "No model configured for {}",
                config.provider
            ))
            .with_context("provider", config.provider.as_str())
            .into());
        }

        Ok(Arc::new(OpenAiClient::new(
            config.provider,
            api_key,
            config.model.trim(),
            self.timeout,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::llm::default_provider_table;

    #[test]
    fn test_token_usage_shared_between_clones() {
        let usage = TokenUsage::default();
        let clone = usage.clone();
        usage.add(10, 5);
        clone.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }

    #[tokio::test]
    async fn test_factory_requires_key() {
        let factory = OpenAiCompatibleFactory::default();
        let config = default_provider_table().remove(0);
        let err = factory.construct(&config).await.err().unwrap();
        let domain = err.as_domain().unwrap();
        assert_eq!(domain.kind(), ErrorKind::Configuration);
        assert!(domain.message().contains("together_ai"));
    }

    #[tokio::test]
    async fn test_factory_requires_model() {
        let factory = OpenAiCompatibleFactory::default();
        let config = default_provider_table().remove(1).with_api_key("g").with_model(" ");
        let err = factory.construct(&config).await.err().unwrap();
        assert_eq!(err.as_domain().map(|e| e.kind()), Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_factory_builds_client() {
        let factory = OpenAiCompatibleFactory::default();
        let config = default_provider_table().remove(3).with_api_key("sk-test");
        let client = factory.construct(&config).await.unwrap();
        assert_eq!(client.provider(), ProviderId::OpenAi);
        assert_eq!(client.model(), "gpt-4o-mini");
        assert_eq!(client.token_usage(), (0, 0, 0));
    }
}
