//! LLM 客户端抽象
//!
//! 每个提供方（Together AI / Gemini / Perplexity / OpenAI）的客户端实现 LlmClient；
//! ClientFactory 负责按 ProviderConfig 构造客户端，是回退编排器唯一依赖的构造入口。

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, Stream};

use crate::core::Failure;
use crate::llm::{Message, ProviderConfig, ProviderId};

/// 单次完成结果（含 token 计数，供用量统计）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, Failure>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<Completion, Failure>;

    /// 流式完成；默认实现把非流式结果作为单个分片返回
    async fn complete_stream(&self, messages: &[Message]) -> Result<CompletionStream, Failure> {
        let completion = self.complete(messages).await?;
        Ok(Box::pin(stream::once(async move { Ok(completion.content) })))
    }

    fn provider(&self) -> ProviderId;

    fn model(&self) -> &str;

    /// 累计 token：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 客户端构造器
///
/// 缺少凭据或模型应返回 Configuration 类失败（不重试、不包装，计一次熔断失败）；
/// 网络 / 5xx 类失败返回可重试的 Failure。
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn construct(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmClient>, Failure>;
}
