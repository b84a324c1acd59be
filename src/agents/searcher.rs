//! Searcher：为在途章节执行检索并汇总证据
//!
//! 单条检索失败记日志后跳过；只有全部失败（或没有检索词）才是 AllQueriesFailed。
//! 零结果不算失败。

use std::sync::Arc;

use super::AgentOutput;
use crate::core::error::PhaseError;
use crate::core::state::{ResearchState, StatePatch};
use crate::search::{dedupe_by_url, format_sources, truncate_chars, SearchProvider};

pub struct Searcher {
    search: Arc<dyn SearchProvider>,
    queries_per_section: usize,
    max_evidence_chars: usize,
    max_chars_per_source: usize,
}

impl Searcher {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        queries_per_section: usize,
        max_evidence_chars: usize,
        max_chars_per_source: usize,
    ) -> Self {
        Self {
            search,
            queries_per_section,
            max_evidence_chars,
            max_chars_per_source,
        }
    }

    pub async fn research(&self, state: &ResearchState) -> Result<AgentOutput, PhaseError> {
        let Some(section) = state.active_section.as_ref() else {
            return Err(PhaseError::AllQueriesFailed {
                attempted: 0,
                last_error: "no active section".to_string(),
            });
        };

        let queries: Vec<&String> = state
            .pending_queries
            .iter()
            .take(self.queries_per_section)
            .collect();
        if queries.is_empty() {
            return Err(PhaseError::AllQueriesFailed {
                attempted: 0,
                last_error: "no queries given".to_string(),
            });
        }

        let mut hits = Vec::new();
        let mut succeeded = 0usize;
        let mut last_error = String::new();
        for query in &queries {
            match self.search.search(query).await {
                Ok(found) => {
                    succeeded += 1;
                    hits.extend(found);
                }
                Err(e) => {
                    tracing::warn!(section = %section.title, query = %query, "Search failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        if succeeded == 0 {
            return Err(PhaseError::AllQueriesFailed {
                attempted: queries.len(),
                last_error,
            });
        }

        let hits = dedupe_by_url(hits);
        let evidence = truncate_chars(
            &format_sources(&hits, self.max_chars_per_source),
            self.max_evidence_chars,
        );
        let audit = format!(
            "{succeeded}/{} queries succeeded, {} unique sources",
            queries.len(),
            hits.len()
        );
        tracing::info!(section = %section.title, sources = hits.len(), "Evidence gathered");

        Ok(AgentOutput {
            patch: StatePatch::Researched { evidence },
            audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Section;
    use crate::search::{MockSearchProvider, SearchError, SearchHit};

    fn active_state(queries: &[&str]) -> ResearchState {
        let section = Section::new("Vectors", "basics", vec!["Addition".to_string()]);
        ResearchState::new("Linear Algebra", 1)
            .apply(StatePatch::Planned {
                sections: vec![section.clone()],
                queries: vec![],
            })
            .unwrap()
            .apply(StatePatch::Activated {
                section,
                queries: queries.iter().map(|q| q.to_string()).collect(),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_partial_failures_are_skipped() {
        let search = Arc::new(MockSearchProvider::from_fn(|q| {
            if q == "bad" {
                Err(SearchError::Timeout(20))
            } else {
                Ok(vec![SearchHit::new(q, format!("https://e.org/{q}"), "text")])
            }
        }));
        let searcher = Searcher::new(search.clone(), 3, 10_000, 500);
        let output = searcher
            .research(&active_state(&["good", "bad", "fine", "over budget"]))
            .await
            .unwrap();

        assert_eq!(search.call_count(), 3);
        assert_eq!(output.audit, "2/3 queries succeeded, 2 unique sources");
        match output.patch {
            StatePatch::Researched { evidence } => {
                assert!(evidence.contains("URL: https://e.org/good"));
                assert!(!evidence.contains("over budget"));
            }
            other => panic!("unexpected patch {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_failed() {
        let searcher = Searcher::new(Arc::new(MockSearchProvider::failing("offline")), 3, 10_000, 500);
        let err = searcher.research(&active_state(&["a", "b"])).await.unwrap_err();
        assert_eq!(
            err,
            PhaseError::AllQueriesFailed {
                attempted: 2,
                last_error: "Network error: offline".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_no_queries_is_failure_but_no_results_is_not() {
        let searcher = Searcher::new(Arc::new(MockSearchProvider::empty()), 3, 10_000, 500);
        assert!(matches!(
            searcher.research(&active_state(&[])).await,
            Err(PhaseError::AllQueriesFailed { attempted: 0, .. })
        ));
        let output = searcher.research(&active_state(&["a"])).await.unwrap();
        assert_eq!(output.audit, "1/1 queries succeeded, 0 unique sources");
    }

    #[tokio::test]
    async fn test_evidence_is_capped() {
        let search = Arc::new(MockSearchProvider::from_fn(|q| {
            Ok(vec![SearchHit::new(q, format!("https://e.org/{q}"), "x".repeat(1000))])
        }));
        let searcher = Searcher::new(search, 3, 200, 1000);
        let output = searcher.research(&active_state(&["a", "b"])).await.unwrap();
        match output.patch {
            StatePatch::Researched { evidence } => {
                assert!(evidence.ends_with("...[truncated]"));
                assert!(evidence.chars().count() <= 200 + "\n...[truncated]".len());
            }
            other => panic!("unexpected patch {other:?}"),
        }
    }
}
