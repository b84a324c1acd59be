//! 章节检索词推导
//!
//! 首个章节沿用规划阶段的检索词；之后的章节与重试由标题、描述、子章节标题确定性生成。

use crate::core::state::Section;

fn push_unique(out: &mut Vec<String>, query: String) {
    let query = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if !query.is_empty() && !out.iter().any(|q| q.eq_ignore_ascii_case(&query)) {
        out.push(query);
    }
}

/// 章节检索词：主题+标题、标题+描述、各子章节
pub fn section_queries(topic: &str, section: &Section, budget: usize) -> Vec<String> {
    let mut out = Vec::new();
    push_unique(&mut out, format!("{topic} {}", section.title));
    push_unique(&mut out, format!("{} {}", section.title, section.description));
    for sub in &section.subsection_titles {
        push_unique(&mut out, format!("detailed information about {sub}"));
    }
    out.truncate(budget);
    out
}

/// 检索全部失败后的放宽检索词：更短、更泛
pub fn widened_queries(topic: &str, section: &Section, budget: usize) -> Vec<String> {
    let mut out = Vec::new();
    push_unique(&mut out, section.title.clone());
    push_unique(&mut out, topic.to_string());
    push_unique(&mut out, format!("{} overview", section.title));
    push_unique(&mut out, format!("{topic} introduction"));
    out.truncate(budget);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section() -> Section {
        Section::new(
            "Eigenvalues",
            "spectral   decomposition",
            vec!["Characteristic polynomial".to_string(), "Diagonalization".to_string()],
        )
    }

    #[test]
    fn test_section_queries_respect_budget() {
        let queries = section_queries("Linear Algebra", &section(), 3);
        assert_eq!(
            queries,
            vec![
                "Linear Algebra Eigenvalues".to_string(),
                "Eigenvalues spectral decomposition".to_string(),
                "detailed information about Characteristic polynomial".to_string(),
            ]
        );
    }

    #[test]
    fn test_widened_queries_are_distinct_from_section_queries() {
        let widened = widened_queries("Linear Algebra", &section(), 3);
        assert_eq!(widened[0], "Eigenvalues");
        let original = section_queries("Linear Algebra", &section(), 10);
        assert!(widened.iter().all(|q| !original.contains(q)));
    }

    #[test]
    fn test_duplicates_collapse() {
        let s = Section::new("Topology", "", vec![]);
        let queries = widened_queries("Topology", &s, 10);
        assert_eq!(
            queries,
            vec!["Topology".to_string(), "Topology overview".to_string(), "Topology introduction".to_string()]
        );
    }
}
