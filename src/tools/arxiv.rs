//! arXiv 检索工具
//!
//! GET Atom 接口（按相关度排序），用 quick-xml 事件流解析为 Paper 列表。
//! 整个请求经 external-search 策略保护：网络错误 / 5xx 退避重试，参数错误直接返回。
//! 返回体无法解析或 arXiv 报告查询错误时标记 no_retry（同样的请求重试也不会成功）。

use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::core::{CircuitBreakerRegistry, Failure, GuardedCall, RetryPolicy, SurveyError, ARXIV_SERVICE};
use crate::observability::redact_display;

pub const MAX_ARXIV_RESULTS: u32 = 50;
pub const ARXIV_API_URL: &str = "https://export.arxiv.org/api/query";

const USER_AGENT: &str = concat!("survey-guard/", env!("CARGO_PKG_VERSION"));
const ERROR_ENTRY_PREFIX: &str = "http://arxiv.org/api/errors";

/// 检索结果中的一篇论文
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paper {
    pub title: String,
    pub authors: Vec<String>,
    /// YYYY-MM-DD
    pub published: String,
    pub summary: String,
    pub pdf_url: Option<String>,
    pub entry_id: String,
    pub categories: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum FeedError {
    #[error("xml parse: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
}

pub struct ArxivClient {
    http: reqwest::Client,
    base_url: String,
    guard: GuardedCall,
}

impl ArxivClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, SurveyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                SurveyError::configuration(format!("Failed to build HTTP client: {e}")).with_source(e)
            })?;
        Ok(Self::with_guard(
            http,
            base_url,
            GuardedCall::new(RetryPolicy::external_search(), breakers),
        ))
    }

    pub fn with_guard(http: reqwest::Client, base_url: impl Into<String>, guard: GuardedCall) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            guard,
        }
    }

    pub fn guard(&self) -> &GuardedCall {
        &self.guard
    }

    /// 检索论文；`max_results` 必须在 1..=50
    pub async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, SurveyError> {
        let query = query.trim();
        validate_request(query, max_results)?;

        let logged_query = redact_display(&query);
        tracing::info!(
            component = "tools",
            operation = "arxiv_search",
            query = %logged_query,
            max_results,
            "Starting arXiv search"
        );

        let papers = self
            .guard
            .execute("arxiv_search", || self.fetch(query, max_results))
            .await?;

        if papers.is_empty() {
            tracing::warn!(query = %logged_query, max_results, "No papers found for query");
        } else {
            tracing::info!(count = papers.len(), "arXiv search completed successfully");
        }
        Ok(papers)
    }

    async fn fetch(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, Failure> {
        let max = max_results.to_string();
        let body = self
            .http
            .get(&self.base_url)
            .query(&[
                ("search_query", query),
                ("start", "0"),
                ("max_results", max.as_str()),
                ("sortBy", "relevance"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut papers = parse_atom_feed(&body)?;
        papers.truncate(max_results as usize);
        Ok(papers)
    }
}

impl std::fmt::Debug for ArxivClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArxivClient")
            .field("base_url", &self.base_url)
            .field("guard", &self.guard)
            .finish()
    }
}

fn validate_request(query: &str, max_results: u32) -> Result<(), SurveyError> {
    if query.is_empty() {
        return Err(SurveyError::configuration("Empty query provided to arXiv search")
            .with_user_message("Please enter a research topic.")
            .with_context("service", ARXIV_SERVICE)
            .with_context("max_results", max_results));
    }
    if max_results == 0 || max_results > MAX_ARXIV_RESULTS {
        return Err(SurveyError::configuration(format!(
            "Invalid max_results: {max_results}. Must be between 1 and {MAX_ARXIV_RESULTS}"
        ))
        .with_user_message(format!("The number of papers must be between 1 and {MAX_ARXIV_RESULTS}."))
        .with_context("service", ARXIV_SERVICE)
        .with_context("query", query)
        .with_context("max_results", max_results));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Title,
    Summary,
    Published,
    AuthorName,
}

/// 解析 arXiv Atom 返回体
pub fn parse_atom_feed(xml: &str) -> Result<Vec<Paper>, SurveyError> {
    let entries = read_entries(xml).map_err(|e| {
        SurveyError::external_service(ARXIV_SERVICE, format!("Failed to parse arXiv response: {e}"))
            .no_retry()
            .with_source(e)
    })?;

    if let Some(err) = entries.iter().find(|p| p.entry_id.starts_with(ERROR_ENTRY_PREFIX)) {
        return Err(SurveyError::external_service(
            ARXIV_SERVICE,
            format!("arXiv rejected the query: {}", err.summary),
        )
        .no_retry()
        .with_context("entry_id", err.entry_id.as_str()));
    }
    Ok(entries)
}

fn read_entries(xml: &str) -> Result<Vec<Paper>, FeedError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut papers = Vec::new();
    let mut current: Option<Paper> = None;
    let mut field: Option<Field> = None;
    let mut in_author = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.local_name();
                match (name.as_ref(), current.is_some()) {
                    (b"entry", _) => current = Some(Paper::default()),
                    (b"author", true) => in_author = true,
                    (b"name", true) if in_author => field = Some(Field::AuthorName),
                    (b"id", true) => field = Some(Field::Id),
                    (b"title", true) => field = Some(Field::Title),
                    (b"summary", true) => field = Some(Field::Summary),
                    (b"published", true) => field = Some(Field::Published),
                    (_, true) => {
                        if let Some(paper) = current.as_mut() {
                            apply_attributes(paper, &e)?;
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                if let Some(paper) = current.as_mut() {
                    apply_attributes(paper, &e)?;
                }
            }
            Event::Text(t) => {
                if let (Some(paper), Some(f)) = (current.as_mut(), field) {
                    push_text(paper, f, &t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let (Some(paper), Some(f)) = (current.as_mut(), field) {
                    push_text(paper, f, &String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"entry" => {
                    if let Some(paper) = current.take() {
                        papers.push(finish(paper));
                    }
                    in_author = false;
                    field = None;
                }
                b"author" => in_author = false,
                _ => field = None,
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(papers)
}

/// `<link title="pdf" href=.../>` 与 `<category term=.../>`
fn apply_attributes(paper: &mut Paper, e: &BytesStart<'_>) -> Result<(), FeedError> {
    match e.local_name().as_ref() {
        b"link" => {
            let is_pdf = match e.try_get_attribute("title")? {
                Some(attr) => attr.unescape_value()? == "pdf",
                None => false,
            };
            if is_pdf {
                if let Some(href) = e.try_get_attribute("href")? {
                    paper.pdf_url = Some(href.unescape_value()?.into_owned());
                }
            }
        }
        b"category" => {
            if let Some(term) = e.try_get_attribute("term")? {
                let term = term.unescape_value()?.into_owned();
                if !paper.categories.contains(&term) {
                    paper.categories.push(term);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn push_text(paper: &mut Paper, field: Field, text: &str) {
    let target = match field {
        Field::Id => &mut paper.entry_id,
        Field::Title => &mut paper.title,
        Field::Summary => &mut paper.summary,
        Field::Published => &mut paper.published,
        Field::AuthorName => {
            paper.authors.push(text.trim().to_string());
            return;
        }
    };
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(text);
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn finish(mut paper: Paper) -> Paper {
    paper.title = collapse_whitespace(&paper.title);
    paper.summary = paper.summary.trim().to_string();
    paper.entry_id = paper.entry_id.trim().to_string();
    // 2021-01-01T00:00:00Z → 2021-01-01
    paper.published = paper.published.trim().chars().take(10).collect();
    paper
}
