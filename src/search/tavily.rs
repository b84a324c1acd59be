//! Tavily 检索后端
//!
//! POST https://api.tavily.com/search；请求原始网页内容时，HTML 用 html2text 提取可读文本，
//! 失败时回退到简易去标签。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{SearchError, SearchHit, SearchProvider};
use crate::config::SearchSection;

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

pub struct TavilySearch {
    client: Client,
    api_key: String,
    endpoint: String,
    max_results: usize,
    include_raw_content: bool,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    include_raw_content: bool,
    search_depth: &'static str,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    raw_content: Option<String>,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20 && s.contains('<') && (s.contains("</") || s.contains("<head")))
}

fn readable_text(raw: &str) -> String {
    let raw = raw.trim_start_matches('\u{FEFF}');
    if !looks_like_html(raw) {
        return raw.to_string();
    }
    match from_read(raw.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(raw),
    }
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>, cfg: &SearchSection) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            endpoint: TAVILY_ENDPOINT.to_string(),
            max_results: cfg.max_results,
            include_raw_content: cfg.include_raw_content,
            timeout_secs: cfg.timeout_secs,
        }
    }

    /// 替换端点（自建代理）
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn to_hit(&self, result: TavilyResult) -> SearchHit {
        let snippet = match result.raw_content.as_deref() {
            Some(raw) if self.include_raw_content && !raw.trim().is_empty() => readable_text(raw),
            _ => result.content,
        };
        let title = if result.title.trim().is_empty() {
            result.url.clone()
        } else {
            result.title
        };
        SearchHit {
            title,
            url: result.url,
            snippet,
        }
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        tracing::debug!(query = %query, "tavily search");
        let body = TavilyRequest {
            api_key: &self.api_key,
            query,
            max_results: self.max_results,
            include_raw_content: self.include_raw_content,
            search_depth: "basic",
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout(self.timeout_secs)
                } else {
                    SearchError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SearchError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: TavilyResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::InvalidResponse(e.to_string()))?;
        Ok(parsed.results.into_iter().map(|r| self.to_hit(r)).collect())
    }

    fn name(&self) -> &str {
        "tavily"
    }
}
