//! survey-guard：文献综述助手的韧性核心
//!
//! 模块划分：
//! - **core**: 错误分类、重试判定、熔断器注册表、受保护调用（GuardedCall）
//! - **llm**: 提供方注册与选择、客户端构造与回退、用量统计、受保护补全
//! - **tools**: arXiv 检索
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 初始化、日志脱敏、会话 span
//! - **services**: 按配置装配上述组件

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod services;
pub mod tools;

pub use crate::core::{Failure, GuardedCall, RetryPolicy, SurveyError};
pub use crate::services::{Services, ServicesBuilder};
