//! Mock LLM 客户端与构造器（用于测试，无需 API）

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::core::Failure;
use crate::llm::{ClientFactory, Completion, LlmClient, Message, ProviderConfig, ProviderId, Role};

/// 回显最后一条 User 消息；可预置若干次失败
#[derive(Debug)]
pub struct MockLlmClient {
    provider: ProviderId,
    model: String,
    failures: Mutex<VecDeque<Failure>>,
    calls: AtomicU64,
}

impl MockLlmClient {
    pub fn new(provider: ProviderId, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// 之后的调用依次先返回这些失败
    pub fn failing_with(self, failures: impl IntoIterator<Item = Failure>) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(failures);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next_failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(failure) = next_failure {
            return Err(failure);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let input_tokens = messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        let content = format!("Echo from {}: {}", self.provider, last_user);
        let output_tokens = content.split_whitespace().count() as u64;

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
}

/// 按提供方脚本化的构造器：每次 construct 依次消费预置失败，用完后返回 MockLlmClient
#[derive(Debug, Default)]
pub struct MockClientFactory {
    scripts: Mutex<HashMap<ProviderId, VecDeque<Failure>>>,
    attempts: Mutex<Vec<ProviderId>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(self, provider: ProviderId, failures: impl IntoIterator<Item = Failure>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(provider)
            .or_default()
            .extend(failures);
        self
    }

    /// 所有 construct 调用的提供方（按调用顺序）
    pub fn attempts(&self) -> Vec<ProviderId> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn construct(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmClient>, Failure> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config.provider);

        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&config.provider)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(failure) => Err(failure),
            None => Ok(Arc::new(MockLlmClient::new(config.provider, config.model.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let client = MockLlmClient::new(ProviderId::Gemini, "gemini-2.5-flash");
        let completion = client
            .complete(&[Message::system("be brief"), Message::user("hello world")])
            .await
            .unwrap();
        assert_eq!(completion.content, "Echo from gemini: hello world");
        assert_eq!(completion.input_tokens, 4);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let client = MockLlmClient::new(ProviderId::OpenAi, "gpt-4o-mini")
            .failing_with([Failure::timeout("slow")]);
        assert!(client.complete(&[Message::user("hi")]).await.is_err());
        assert!(client.complete(&[Message::user("hi")]).await.is_ok());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_default_stream_yields_single_chunk() {
        use futures_util::StreamExt;

        let client = MockLlmClient::new(ProviderId::OpenAi, "gpt-4o-mini");
        let mut stream = client.complete_stream(&[Message::user("stream me")]).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, "Echo from openai: stream me");
        assert!(stream.next().await.is_none());
    }
}
