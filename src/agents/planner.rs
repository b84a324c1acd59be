//! Planner：生成规划检索词与章节计划
//!
//! 两次能力调用：先生成 target 个检索词，（可选）检索一轮作为规划上下文，
//! 再生成 target 个章节，每章带固定数量的子章节标题。数量不符即 PlanningError（不重试）。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use super::{generate, prompts, AgentOutput};
use crate::config::ResearchSection;
use crate::core::error::PhaseError;
use crate::core::state::{ResearchState, Section, StatePatch};
use crate::llm::LlmClient;
use crate::search::{dedupe_by_url, format_sources, SearchProvider};

/// 规划检索词
#[derive(Debug, Deserialize, JsonSchema)]
pub struct QueryPlan {
    pub queries: Vec<PlannedQuery>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlannedQuery {
    /// 一条网页检索词
    pub search_query: String,
}

/// 章节计划
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SectionPlan {
    pub sections: Vec<PlannedSection>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlannedSection {
    /// 章节名
    pub name: String,
    /// 本章覆盖的主要内容
    pub description: String,
    /// 子章节标题
    #[serde(default)]
    pub subsection_titles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub subsections_per_section: usize,
    pub report_structure: String,
    pub plan_with_search: bool,
    pub max_chars_per_source: usize,
}

impl PlannerSettings {
    pub fn from_config(research: &ResearchSection, max_chars_per_source: usize) -> Self {
        Self {
            subsections_per_section: research.subsections_per_section,
            report_structure: research.report_structure.clone(),
            plan_with_search: research.plan_with_search,
            max_chars_per_source,
        }
    }
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn SearchProvider>,
    settings: PlannerSettings,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchProvider>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            llm,
            search,
            settings,
        }
    }

    pub async fn plan(&self, state: &ResearchState) -> Result<AgentOutput, PhaseError> {
        let target = state.target_section_count;
        let topic = state.topic.as_str();

        let query_plan: QueryPlan = generate(
            self.llm.as_ref(),
            prompts::PLANNER_SYSTEM,
            &prompts::query_plan_prompt(topic, &self.settings.report_structure, target),
        )
        .await
        .map_err(|e| PhaseError::Planning(format!("query generation {e}")))?;

        let queries: Vec<String> = query_plan
            .queries
            .into_iter()
            .map(|q| q.search_query.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();

        let context = if self.settings.plan_with_search {
            self.planning_context(&queries).await
        } else {
            String::new()
        };

        let plan: SectionPlan = generate(
            self.llm.as_ref(),
            prompts::PLANNER_SYSTEM,
            &prompts::section_plan_prompt(
                topic,
                &self.settings.report_structure,
                target,
                self.settings.subsections_per_section,
                &context,
            ),
        )
        .await
        .map_err(|e| PhaseError::Planning(format!("section planning {e}")))?;

        let sections = validate_plan(plan, target)?;
        let audit = format!(
            "{} sections planned, {} planning queries",
            sections.len(),
            queries.len()
        );
        tracing::info!(topic = %topic, sections = sections.len(), "Plan ready");

        Ok(AgentOutput {
            patch: StatePatch::Planned { sections, queries },
            audit,
        })
    }

    /// 规划上下文：检索失败只记日志
    async fn planning_context(&self, queries: &[String]) -> String {
        let mut hits = Vec::new();
        for query in queries {
            match self.search.search(query).await {
                Ok(found) => hits.extend(found),
                Err(e) => tracing::warn!(query = %query, "Planning search failed: {}", e),
            }
        }
        if hits.is_empty() {
            return String::new();
        }
        format_sources(&dedupe_by_url(hits), self.settings.max_chars_per_source)
    }
}

fn validate_plan(plan: SectionPlan, target: usize) -> Result<Vec<Section>, PhaseError> {
    if plan.sections.len() != target {
        return Err(PhaseError::Planning(format!(
            "expected {target} sections, model returned {}",
            plan.sections.len()
        )));
    }

    plan.sections
        .into_iter()
        .map(|s| {
            let titles: Vec<String> = s
                .subsection_titles
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            let name = s.name.trim().to_string();
            if titles.is_empty() {
                return Err(PhaseError::Planning(format!(
                    "section '{name}' has no subsections"
                )));
            }
            Ok(Section::new(name, s.description.trim(), titles))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};
    use crate::search::MockSearchProvider;

    fn settings(plan_with_search: bool) -> PlannerSettings {
        PlannerSettings {
            subsections_per_section: 6,
            report_structure: "structure".to_string(),
            plan_with_search,
            max_chars_per_source: 500,
        }
    }

    #[tokio::test]
    async fn test_plan_with_mock_llm() {
        let search = Arc::new(MockSearchProvider::canned());
        let planner = Planner::new(Arc::new(MockLlmClient), search.clone(), settings(true));
        let output = planner
            .plan(&ResearchState::new("Linear Algebra", 2))
            .await
            .unwrap();

        match output.patch {
            StatePatch::Planned { sections, queries } => {
                assert_eq!(sections.len(), 2);
                assert!(sections.iter().all(|s| s.subsection_titles.len() == 6));
                assert_eq!(queries.len(), 2);
                assert_eq!(search.call_count(), 2);
            }
            other => panic!("unexpected patch {other:?}"),
        }
        assert!(output.audit.starts_with("2 sections planned"));
    }

    #[tokio::test]
    async fn test_plan_count_mismatch_is_planning_error() {
        let llm = ScriptedLlmClient::new(|n, messages| match n {
            0 => Ok(r#"{"queries": [{"search_query": "a"}]}"#.to_string()),
            _ => {
                assert!(messages[1].content.contains("list of 3 main sections"));
                Ok(r#"{"sections": [{"name": "Only", "description": "d", "subsection_titles": ["x"]}]}"#.to_string())
            }
        });
        let planner = Planner::new(
            Arc::new(llm),
            Arc::new(MockSearchProvider::canned()),
            settings(false),
        );
        let err = planner
            .plan(&ResearchState::new("Topology", 3))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PhaseError::Planning("expected 3 sections, model returned 1".to_string())
        );
    }

    #[tokio::test]
    async fn test_plan_rejects_empty_subsections() {
        let llm = ScriptedLlmClient::new(|n, _| match n {
            0 => Ok(r#"{"queries": []}"#.to_string()),
            _ => Ok(r#"{"sections": [{"name": "Bare", "description": "d", "subsection_titles": ["  "]}]}"#.to_string()),
        });
        let planner = Planner::new(
            Arc::new(llm),
            Arc::new(MockSearchProvider::failing("offline")),
            settings(true),
        );
        let err = planner.plan(&ResearchState::new("Topology", 1)).await.unwrap_err();
        assert!(matches!(err, PhaseError::Planning(msg) if msg.contains("'Bare' has no subsections")));
    }
}
