//! LLM 层：提供方注册与选择、客户端构造与回退、用量统计、受保护补全

pub mod chat;
pub mod fallback;
pub mod message;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod traits;
pub mod usage;

pub use chat::ResilientChat;
pub use fallback::{ProviderFallback, ProviderInfo, ProviderSummary, NO_PROVIDERS_ERROR};
pub use message::{Message, Role};
pub use mock::{MockClientFactory, MockLlmClient};
pub use openai::{OpenAiClient, OpenAiCompatibleFactory, TokenUsage};
pub use provider::{
    default_provider_table, CredentialChain, CredentialSource, EnvCredentials, ProviderConfig,
    ProviderId, ProviderRegistry, RateLimit, StaticCredentials,
};
pub use traits::{ClientFactory, Completion, CompletionStream, LlmClient};
pub use usage::{ProviderStats, UsageMonitor, UsageParams, UsageRecord, UsageTotals};
