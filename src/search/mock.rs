//! Mock 检索后端：无 API Key 时的回退，也供测试注入失败与计数

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{SearchError, SearchHit, SearchProvider};

type SearchFn = dyn Fn(&str) -> Result<Vec<SearchHit>, SearchError> + Send + Sync;

pub struct MockSearchProvider {
    respond: Box<SearchFn>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl MockSearchProvider {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<SearchHit>, SearchError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(f),
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// 每个查询返回两条结果，其中一条 URL 在所有查询间共享（用于验证去重）
    pub fn canned() -> Self {
        Self::from_fn(|query| {
            let slug: String = query
                .to_lowercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect();
            Ok(vec![
                SearchHit::new(
                    format!("{query} - overview"),
                    format!("https://example.org/{slug}"),
                    format!("Background material about {query}."),
                ),
                SearchHit::new(
                    "Reference handbook",
                    "https://example.org/handbook",
                    "General reference material.",
                ),
            ])
        })
    }

    /// 所有查询都失败
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_fn(move |_| Err(SearchError::Network(message.clone())))
    }

    /// 所有查询都返回空结果
    pub fn empty() -> Self {
        Self::from_fn(|_| Ok(Vec::new()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut q) = self.queries.lock() {
            q.push(query.to_string());
        }
        (self.respond)(query)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
