//! survey-guard 命令行
//!
//! 用法：
//!   survey-guard providers              可用提供方与用量
//!   survey-guard breakers               熔断器状态
//!   survey-guard client [provider]      按优先级（或指定首选）构造客户端
//!   survey-guard search <query> [max]   arXiv 检索
//!
//! 输出均为 JSON。

use anyhow::{bail, Context};
use serde_json::{json, Value};
use survey_guard::config::load_config;
use survey_guard::core::user_friendly_message;
use survey_guard::llm::ProviderId;
use survey_guard::observability::{self, log_error_with_details};
use survey_guard::{Services, ServicesBuilder, SurveyError};
use tracing::Instrument;

const USAGE: &str = "usage: survey-guard <providers|breakers|client [provider]|search <query> [max]>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        bail!(USAGE);
    };

    let cfg = load_config(None).context("Failed to load configuration")?;
    let services = ServicesBuilder::new(cfg)
        .build()
        .context("Failed to initialize services")?;

    let session_id = observability::new_session_id();
    let output = run(&services, command, &args[1..])
        .instrument(observability::session_span(&session_id))
        .await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(services: &Services, command: &str, args: &[String]) -> anyhow::Result<Value> {
    let output = match command {
        "providers" => serde_json::to_value(services.providers.provider_info())?,
        "breakers" => serde_json::to_value(services.breakers.status())?,
        "client" => {
            let preferred = match args.first() {
                Some(name) => {
                    let id = name
                        .parse::<ProviderId>()
                        .map_err(|e| report(e, "parse_provider"))?;
                    services
                        .providers
                        .registry()
                        .available_providers()
                        .into_iter()
                        .find(|c| c.provider == id)
                }
                None => None,
            };
            let client = services
                .providers
                .create_client_with_fallback(preferred.as_ref())
                .await
                .map_err(|e| report(e, "create_client"))?;
            json!({ "provider": client.provider(), "model": client.model() })
        }
        "search" => {
            let Some(query) = args.first() else {
                bail!(USAGE);
            };
            let max = match args.get(1) {
                Some(raw) => raw
                    .parse::<u32>()
                    .with_context(|| format!("Invalid max results: {raw}"))?,
                None => services.config.max_papers(),
            };
            let papers = services
                .arxiv
                .search(query, max)
                .await
                .map_err(|e| report(e, "arxiv_search"))?;
            serde_json::to_value(papers)?
        }
        other => bail!("unknown command: {other}\n{USAGE}"),
    };
    Ok(output)
}

/// 记录完整错误详情，向用户只展示安全消息
fn report(err: SurveyError, operation: &str) -> anyhow::Error {
    log_error_with_details(&err, operation, "cli");
    anyhow::anyhow!("{} (error id {})", user_friendly_message(&err), err.id())
}
