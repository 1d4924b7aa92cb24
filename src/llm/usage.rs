//! 用量与成本统计
//!
//! 每次模型调用记录一条 UsageRecord（token、费用、耗时、成功与否），
//! 以 JSON 数组形式持久化到 `data_dir/usage_data.json`。启动时加载；文件损坏时记 warn 并从空开始。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{SurveyError, EXPORT_SERVICE};
use crate::llm::ProviderId;
use crate::observability::redact_display;

pub const USAGE_FILE_NAME: &str = "usage_data.json";

/// 未收录模型的兜底价格（USD / 1M tokens）
const FALLBACK_PRICE: ModelPrice = ModelPrice {
    input: 1.00,
    output: 1.00,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

/// 每百万 token 单价
pub fn model_price(provider: ProviderId, model: &str) -> ModelPrice {
    let price = |input, output| Some(ModelPrice { input, output });
    let found = match (provider, model) {
        (ProviderId::TogetherAi, "meta-llama/Llama-3.1-8B-Instruct-Turbo")
        | (ProviderId::TogetherAi, "meta-llama/Llama-3.1-8B-Instruct") => price(0.20, 0.20),
        (ProviderId::TogetherAi, "meta-llama/Llama-3.1-70B-Instruct-Turbo") => price(0.90, 0.90),
        (ProviderId::Gemini, "gemini-2.0-flash-exp") | (ProviderId::Gemini, "gemini-1.5-flash") => {
            price(0.075, 0.30)
        }
        (ProviderId::Gemini, "gemini-1.5-pro") => price(1.25, 5.00),
        (ProviderId::Perplexity, "llama-3.1-sonar-large-128k-online") => price(1.00, 1.00),
        (ProviderId::Perplexity, "llama-3.1-sonar-small-128k-online") => price(0.20, 0.20),
        (ProviderId::Perplexity, "llama-3.1-sonar-huge-128k-online") => price(2.00, 2.00),
        (ProviderId::OpenAi, "gpt-4o-mini") => price(0.15, 0.60),
        (ProviderId::OpenAi, "gpt-3.5-turbo") => price(0.50, 1.50),
        (ProviderId::OpenAi, "gpt-4o") => price(2.50, 10.00),
        _ => None,
    };
    found.unwrap_or(FALLBACK_PRICE)
}

pub fn calculate_cost(provider: ProviderId, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let price = model_price(provider, model);
    (input_tokens as f64 / 1_000_000.0) * price.input
        + (output_tokens as f64 / 1_000_000.0) * price.output
}

/// 单次调用记录（持久化格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// record_usage 的入参
#[derive(Debug, Clone)]
pub struct UsageParams {
    pub provider: ProviderId,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl UsageParams {
    pub fn success(provider: ProviderId, model: impl Into<String>, input_tokens: u64, output_tokens: u64, duration_ms: u64) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens,
            output_tokens,
            duration_ms,
            success: true,
            error_message: None,
        }
    }

    pub fn failure(provider: ProviderId, model: impl Into<String>, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms,
            success: false,
            error_message: Some(error.into()),
        }
    }
}

/// 汇总统计（全局或单个提供方）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub last_used: Option<String>,
}

pub struct UsageMonitor {
    usage_file: PathBuf,
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageMonitor {
    /// 打开（必要时创建）数据目录并加载已有记录
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, SurveyError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).map_err(|e| {
            SurveyError::configuration(format!(
                "Cannot create usage data directory {}: {}",
                data_dir.display(),
                e
            ))
            .with_context("data_dir", data_dir.display().to_string())
            .with_source(e)
        })?;

        let usage_file = data_dir.join(USAGE_FILE_NAME);
        let records = load_records(&usage_file);
        Ok(Self {
            usage_file,
            records: Mutex::new(records),
        })
    }

    pub fn usage_file(&self) -> &Path {
        &self.usage_file
    }

    /// 记录一次调用并立即落盘；写盘失败只记日志
    pub fn record_usage(&self, params: UsageParams) -> UsageRecord {
        let total_tokens = params.input_tokens + params.output_tokens;
        let cost_usd = calculate_cost(params.provider, &params.model, params.input_tokens, params.output_tokens);
        let record = UsageRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            provider: params.provider.as_str().to_string(),
            model: params.model,
            input_tokens: params.input_tokens,
            output_tokens: params.output_tokens,
            total_tokens,
            cost_usd,
            duration_ms: params.duration_ms,
            success: params.success,
            error_message: params.error_message,
        };

        let mut records = self.lock();
        records.push(record.clone());
        if let Err(e) = write_records(&self.usage_file, &records) {
            tracing::error!(path = %self.usage_file.display(), error = %redact_display(&e), "Failed to save usage data");
        }
        drop(records);

        tracing::info!(
            provider = %record.provider,
            model = %record.model,
            tokens = total_tokens,
            cost = cost_usd,
            success = record.success,
            "Recorded usage: {}/{} - {} tokens, ${:.4}",
            record.provider,
            record.model,
            total_tokens,
            cost_usd
        );
        record
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.lock().clone()
    }

    /// 按提供方聚合；顺序为各提供方首次出现的顺序
    pub fn provider_stats(&self, provider: Option<ProviderId>) -> Vec<ProviderStats> {
        let records = self.lock();
        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<&UsageRecord>> = HashMap::new();
        for record in records
            .iter()
            .filter(|r| provider.is_none_or(|p| r.provider == p.as_str()))
        {
            if !grouped.contains_key(&record.provider) {
                order.push(record.provider.clone());
            }
            grouped.entry(record.provider.clone()).or_default().push(record);
        }

        order
            .into_iter()
            .map(|name| {
                let group = grouped.remove(&name).unwrap_or_default();
                let last_used = group.iter().map(|r| r.timestamp.clone()).max();
                ProviderStats {
                    provider: name,
                    totals: totals(group),
                    last_used,
                }
            })
            .collect()
    }

    pub fn total_usage(&self) -> UsageTotals {
        let records = self.lock();
        totals(records.iter().collect())
    }

    /// 导出全部记录；失败向上返回 Export 错误
    pub fn export_usage_data(&self, path: impl AsRef<Path>) -> Result<(), SurveyError> {
        let path = path.as_ref();
        let records = self.lock();
        write_records(path, &records).map_err(|e| {
            tracing::error!(path = %path.display(), error = %redact_display(&e), "Failed to export usage data");
            SurveyError::export(format!("Failed to export usage data: {e}"))
                .with_context("service", EXPORT_SERVICE)
                .with_context("path", path.display().to_string())
                .with_source(e)
        })?;
        tracing::info!(path = %path.display(), "Usage data exported");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<UsageRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for UsageMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageMonitor")
            .field("usage_file", &self.usage_file)
            .field("records", &self.lock().len())
            .finish()
    }
}

fn totals(records: Vec<&UsageRecord>) -> UsageTotals {
    if records.is_empty() {
        return UsageTotals::default();
    }
    let total_requests = records.len() as u64;
    let successful_requests = records.iter().filter(|r| r.success).count() as u64;
    let duration_sum: u64 = records.iter().map(|r| r.duration_ms).sum();
    UsageTotals {
        total_requests,
        successful_requests,
        failed_requests: total_requests - successful_requests,
        total_tokens: records.iter().map(|r| r.total_tokens).sum(),
        total_cost_usd: records.iter().map(|r| r.cost_usd).sum(),
        avg_duration_ms: duration_sum as f64 / total_requests as f64,
    }
}

fn load_records(path: &Path) -> Vec<UsageRecord> {
    if !path.exists() {
        return Vec::new();
    }
    let loaded = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str::<Vec<UsageRecord>>(&raw).map_err(|e| e.to_string()));
    match loaded {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %redact_display(&e), "Failed to load usage data");
            Vec::new()
        }
    }
}

fn write_records(path: &Path, records: &[UsageRecord]) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json)
}
