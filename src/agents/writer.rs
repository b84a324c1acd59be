//! Writer：为在途章节生成结构化正文
//!
//! 回复经 codec 解码并按章节结构校验（每个子章节一条，且至少一个来源）。
//! 子章节一律以计划中的标题为键：草稿标题（忽略大小写与首尾空白）或位置键
//! `subsectionN` 必须对上计划，对不上的草稿视为不合格。
//! 首次失败后以更严格的提示词重试一次，仍失败则返回 WriteError。

use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use super::{generate, prompts, AgentOutput};
use crate::core::error::PhaseError;
use crate::core::state::{ResearchState, Section, SectionContent, Source, StatePatch, Subsection};
use crate::llm::LlmClient;

const MAX_ATTEMPTS: u32 = 2;

/// 章节正文
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SectionDraft {
    /// 整章概述（100-150 词）
    pub main_text: String,
    /// subsection1、subsection2 … → 子章节
    pub sections: BTreeMap<String, DraftSubsection>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DraftSubsection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Source>,
}

pub struct Writer {
    llm: Arc<dyn LlmClient>,
}

impl Writer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 底层 LLM 的累计 token 用量 (prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn write(&self, state: &ResearchState) -> Result<AgentOutput, PhaseError> {
        let section = state
            .active_section
            .as_ref()
            .ok_or_else(|| PhaseError::Write("no active section".to_string()))?;
        let base_prompt =
            prompts::section_writer_prompt(&state.topic, section, &state.aggregated_evidence);

        let mut problem = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let prompt = if attempt == 1 {
                base_prompt.clone()
            } else {
                format!(
                    "{base_prompt}\n\n{}",
                    prompts::strict_retry_notice(section.subsection_titles.len(), &problem)
                )
            };

            let result = generate::<SectionDraft>(self.llm.as_ref(), prompts::WRITER_SYSTEM, &prompt)
                .await
                .map_err(|e| e.to_string())
                .and_then(|draft| to_content(section, draft));

            match result {
                Ok(content) => {
                    let audit = format!(
                        "'{}' written with {} subsections (attempt {attempt})",
                        section.title,
                        content.subsections.len()
                    );
                    return Ok(AgentOutput {
                        patch: StatePatch::Written {
                            section: section.clone().with_content(content),
                        },
                        audit,
                    });
                }
                Err(e) => {
                    tracing::warn!(section = %section.title, attempt, "Section draft rejected: {}", e);
                    problem = e;
                }
            }
        }

        Err(PhaseError::Write(problem))
    }
}

/// 草稿子章节对应的计划标题：先按标题匹配，再按 `subsectionN` 位置匹配
fn planned_title<'a>(section: &'a Section, key: &str, draft_title: &str) -> Option<&'a str> {
    let draft_title = draft_title.trim();
    let by_title = section
        .subsection_titles
        .iter()
        .find(|t| t.trim().eq_ignore_ascii_case(draft_title));
    let by_position = || {
        key.strip_prefix("subsection")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| section.subsection_titles.get(i))
    };
    by_title.or_else(by_position).map(String::as_str)
}

/// 校验草稿并转为 SectionContent
fn to_content(section: &Section, draft: SectionDraft) -> Result<SectionContent, String> {
    let expected = section.subsection_titles.len();
    if draft.sections.len() != expected {
        return Err(format!(
            "expected {expected} subsections, got {}",
            draft.sections.len()
        ));
    }
    if draft.main_text.trim().is_empty() {
        return Err("mainText is empty".to_string());
    }

    let mut subsections = BTreeMap::new();
    for (key, sub) in draft.sections {
        let Some(title) = planned_title(section, &key, &sub.title) else {
            let shown = if sub.title.trim().is_empty() { &key } else { &sub.title };
            return Err(format!(
                "subsection '{}' does not match any planned subsection title",
                shown.trim()
            ));
        };
        if sub.content.trim().is_empty() {
            return Err(format!("subsection '{title}' has no content"));
        }
        if sub.sources.is_empty() {
            return Err(format!("subsection '{title}' has no sources"));
        }
        let entry = Subsection {
            description: sub.description,
            body: sub.content,
            sources: sub.sources,
        };
        if subsections.insert(title.to_string(), entry).is_some() {
            return Err(format!("duplicate subsection '{title}'"));
        }
    }

    Ok(SectionContent {
        overview: draft.main_text,
        subsections,
    })
}
