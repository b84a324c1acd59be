//! 证据检索：SearchProvider 抽象、来源去重与格式化
//!
//! 零结果不是错误；单次检索失败由 Searcher 决定是否跳过。

pub mod mock;
pub mod tavily;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SearchSection;

pub use mock::MockSearchProvider;
pub use tavily::TavilySearch;

/// 单条检索结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl SearchHit {
    pub fn new(title: impl Into<String>, url: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Search timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;

    fn name(&self) -> &str;
}

/// 按 URL 去重，保留首次出现的结果
pub fn dedupe_by_url(hits: impl IntoIterator<Item = SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.url.clone()))
        .collect()
}

/// 按字符数截断并追加 ...[truncated]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
}

/// 将检索结果格式化为写作提示词中的证据块
pub fn format_sources(hits: &[SearchHit], max_chars_per_source: usize) -> String {
    let mut out = String::from("Sources:\n\n");
    for hit in hits {
        out.push_str(&format!("Source {}:\n===\n", hit.title));
        out.push_str(&format!("URL: {}\n===\n", hit.url));
        out.push_str(&format!(
            "Most relevant content from source: {}\n===\n",
            truncate_chars(hit.snippet.trim(), max_chars_per_source)
        ));
    }
    out.trim_end().to_string()
}

/// 根据 [search] 配置创建检索后端：provider=mock 或缺少 API Key 时使用 Mock
pub fn create_search_from_config(cfg: &SearchSection) -> Arc<dyn SearchProvider> {
    if cfg.provider == "mock" {
        tracing::info!("Search: using mock provider");
        return Arc::new(MockSearchProvider::canned());
    }

    let api_key = cfg
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var("TAVILY_API_KEY").ok())
        .filter(|k| !k.trim().is_empty());

    match (cfg.provider.as_str(), api_key) {
        ("tavily", Some(key)) => {
            tracing::info!(max_results = cfg.max_results, "Search: using Tavily");
            Arc::new(TavilySearch::new(key, cfg))
        }
        ("tavily", None) => {
            tracing::warn!("Search: TAVILY_API_KEY not set, falling back to mock provider");
            Arc::new(MockSearchProvider::canned())
        }
        (other, _) => {
            tracing::warn!("Search: unknown provider '{}', falling back to mock provider", other);
            Arc::new(MockSearchProvider::canned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_first() {
        let hits = vec![
            SearchHit::new("A", "https://a.org", "first"),
            SearchHit::new("B", "https://b.org", "b"),
            SearchHit::new("A again", "https://a.org", "second"),
        ];
        let deduped = dedupe_by_url(hits);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].snippet, "first");
    }

    #[test]
    fn test_format_sources_layout() {
        let hits = vec![SearchHit::new("Eigen", "https://e.org", "λ v = A v")];
        let text = format_sources(&hits, 100);
        assert!(text.starts_with("Sources:\n\nSource Eigen:\n===\nURL: https://e.org\n===\n"));
        assert!(text.contains("Most relevant content from source: λ v = A v"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate_chars("线性代数", 10), "线性代数");
        assert_eq!(truncate_chars("线性代数", 2), "线性\n...[truncated]");
    }

    #[test]
    fn test_factory_without_key_uses_mock() {
        let cfg = SearchSection {
            provider: "mock".to_string(),
            ..SearchSection::default()
        };
        assert_eq!(create_search_from_config(&cfg).name(), "mock");
    }
}
