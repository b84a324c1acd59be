//! 各阶段 Agent 的提示词模板
//!
//! 标签块（`<Report topic>`、`<Section title>`、`<Subsection titles>`）每行一项，
//! 输出结构以 JSON Schema 的形式附在末尾。

use crate::core::state::Section;

pub const PLANNER_SYSTEM: &str = "You are an expert technical writer planning a structured learning roadmap. \
Answer with JSON only.";

pub const WRITER_SYSTEM: &str = "You are an expert technical teacher writing one section of a learning roadmap. \
Answer with JSON only. Keep LaTeX and Markdown inside JSON strings.";

/// 输出结构说明（附在每个提示词末尾）
pub fn output_contract(schema: &str) -> String {
    format!(
        "<Output format>\nRespond with a single JSON object that validates against this JSON Schema. \
Do not add commentary before or after it.\n```json\n{schema}\n```\n</Output format>"
    )
}

pub fn query_plan_prompt(topic: &str, report_structure: &str, count: usize) -> String {
    format!(
        "<Report topic>\n{topic}\n</Report topic>\n\n\
<Report organization>\n{report_structure}\n</Report organization>\n\n\
<Task>\nYour goal is to generate {count} search queries that gather the material needed to decide the sections of this roadmap.\n\
Each query should target the topic directly, be specific enough to surface authoritative sources, \
and together the queries should cover the breadth the organization asks for.\n</Task>"
    )
}

pub fn section_plan_prompt(
    topic: &str,
    report_structure: &str,
    section_count: usize,
    subsection_count: usize,
    context: &str,
) -> String {
    let context = if context.trim().is_empty() {
        "(no search context available)"
    } else {
        context
    };
    format!(
        "<Report topic>\n{topic}\n</Report topic>\n\n\
<Report organization>\n{report_structure}\n</Report organization>\n\n\
<Context>\n{context}\n</Context>\n\n\
<Task>\nProduce a list of {section_count} main sections for the roadmap, in the order a learner should study them.\n\
For every section give a name, a short description of what it covers, \
and a list of {subsection_count} titles for subsections.\n</Task>"
    )
}

pub fn section_writer_prompt(topic: &str, section: &Section, evidence: &str) -> String {
    let titles = section.subsection_titles.join("\n");
    let evidence = if evidence.trim().is_empty() {
        "(no source material was found; rely on well-established knowledge and cite standard references)"
    } else {
        evidence
    };
    format!(
        "<Report topic>\n{topic}\n</Report topic>\n\n\
<Section title>\n{title}\n</Section title>\n\n\
<Section description>\n{description}\n</Section description>\n\n\
<Subsection titles>\n{titles}\n</Subsection titles>\n\n\
<Source material>\n{evidence}\n</Source material>\n\n\
<Task>\nWrite the section. `mainText` is a 100-150 word overview of the whole section. \
`sections` has exactly one entry per subsection title above, each with the title, \
a one-line description, 150-200 words of content and at least one source taken from the source material.\n\
Open every text with its most important insight in **bold**, use short paragraphs, \
and at most one table or short list per subsection. No marketing language.\n</Task>",
        title = section.title,
        description = section.description,
    )
}

/// 第二次撰写尝试追加的约束
pub fn strict_retry_notice(expected_subsections: usize, problem: &str) -> String {
    format!(
        "<Previous attempt rejected>\n{problem}\n</Previous attempt rejected>\n\n\
The previous answer could not be used. Return exactly {expected_subsections} subsection entries, \
each with a non-empty `sources` array. Output only the JSON object; \
escape every backslash inside strings as \\\\ (for example \\\\frac{{1}}{{2}})."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_prompt_lists_one_title_per_line() {
        let section = Section::new(
            "Vectors",
            "Basics",
            vec!["Addition".to_string(), "Dot product".to_string()],
        );
        let prompt = section_writer_prompt("Linear Algebra", &section, "");
        assert!(prompt.contains("<Subsection titles>\nAddition\nDot product\n</Subsection titles>"));
        assert!(prompt.contains("<Section title>\nVectors\n</Section title>"));
        assert!(prompt.contains("no source material was found"));
    }

    #[test]
    fn test_plan_prompts_state_counts() {
        assert!(query_plan_prompt("Topology", "s", 4).contains("generate 4 search queries"));
        let prompt = section_plan_prompt("Topology", "s", 2, 6, "");
        assert!(prompt.contains("list of 2 main sections"));
        assert!(prompt.contains("list of 6 titles for subsections"));
    }

    #[test]
    fn test_strict_notice_shows_escaped_example() {
        let notice = strict_retry_notice(6, "expected 6 subsections, got 2");
        assert!(notice.contains("\\\\frac{1}{2}"));
        assert!(notice.contains("exactly 6 subsection entries"));
    }
}
