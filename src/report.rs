//! 最终报告：把已完成章节渲染为 Markdown
//!
//! 子章节按规划时的标题顺序输出；存储中与计划标题不符的子章节（早期写入的数据）追加在末尾。

use std::fmt::Write as _;

use crate::core::state::{ResearchState, Section, Subsection};

pub fn render_markdown(state: &ResearchState) -> String {
    let mut out = format!("# {}\n", state.topic.trim());
    for section in &state.completed_sections {
        render_section(section, &mut out);
    }
    out
}

fn render_section(section: &Section, out: &mut String) {
    let Some(content) = &section.content else {
        return;
    };
    let _ = write!(out, "\n## {}\n\n{}\n", section.title, content.overview.trim());

    let ordered = section
        .subsection_titles
        .iter()
        .filter_map(|t| content.subsections.get_key_value(t));
    let extra = content
        .subsections
        .iter()
        .filter(|(title, _)| !section.subsection_titles.contains(title));
    for (title, sub) in ordered.chain(extra) {
        render_subsection(title, sub, out);
    }
}

fn render_subsection(title: &str, sub: &Subsection, out: &mut String) {
    let _ = write!(out, "\n### {title}\n\n");
    if !sub.description.trim().is_empty() {
        let _ = write!(out, "*{}*\n\n", sub.description.trim());
    }
    let _ = writeln!(out, "{}", sub.body.trim());
    if !sub.sources.is_empty() {
        out.push_str("\n**Sources**\n\n");
        for source in &sub.sources {
            let _ = writeln!(out, "- [{}]({})", source.title, source.url);
        }
    }
}
