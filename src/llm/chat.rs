//! 受保护的对话补全：language-model 策略 + 按提供方熔断 + 用量记录

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{CircuitBreakerRegistry, GuardedCall, RetryPolicy, SurveyError};
use crate::llm::usage::{UsageMonitor, UsageParams};
use crate::llm::{Completion, LlmClient, Message};

pub struct ResilientChat {
    client: Arc<dyn LlmClient>,
    guard: GuardedCall,
    usage: Option<Arc<UsageMonitor>>,
}

impl ResilientChat {
    pub fn new(client: Arc<dyn LlmClient>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let policy =
            RetryPolicy::language_model().for_service(format!("{}:{}", crate::core::LLM_SERVICE, client.provider()));
        Self {
            client,
            guard: GuardedCall::new(policy, breakers),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Arc<UsageMonitor>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.guard = self.guard.with_cancellation(token);
        self
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    pub fn guard(&self) -> &GuardedCall {
        &self.guard
    }

    /// 一次补全（含内部重试）；成功与最终失败各记一条用量
    pub async fn complete(&self, messages: &[Message]) -> Result<Completion, SurveyError> {
        let started = Instant::now();
        let client = &self.client;
        let result = self
            .guard
            .execute("chat_completion", || client.complete(messages))
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(usage) = &self.usage {
            let params = match &result {
                Ok(c) => UsageParams::success(
                    client.provider(),
                    client.model(),
                    c.input_tokens,
                    c.output_tokens,
                    duration_ms,
                ),
                Err(e) => UsageParams::failure(client.provider(), client.model(), duration_ms, e.to_string()),
            };
            usage.record_usage(params);
        }
        result
    }
}

impl std::fmt::Debug for ResilientChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientChat")
            .field("provider", &self.client.provider())
            .field("model", &self.client.model())
            .field("guard", &self.guard)
            .finish()
    }
}
