//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! - MockLlmClient：识别提示词中的输出 Schema（QueryPlan / SectionPlan / SectionDraft），
//!   生成确定性的合法 JSON，可跑通完整的 规划 → 检索 → 撰写 流程
//! - ScriptedLlmClient：由闭包决定每次调用的返回值，并统计调用次数，便于构造失败场景

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::llm::{LlmClient, LlmError, Message};

static QUERY_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"generate (\d+) search queries").expect("valid regex"));
static SECTION_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"list of (\d+) main sections").expect("valid regex"));
static SUBSECTION_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"list of (\d+) titles for subsections").expect("valid regex"));

/// 取出 `<tag>...</tag>` 之间的文本
fn tagged<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim())
}

fn captured_count(re: &Regex, text: &str, default: usize) -> usize {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(default)
}

/// 离线 Mock：按请求的输出结构生成确定性回复
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    /// 同步生成回复，供 ScriptedLlmClient 委托使用
    pub fn respond(&self, messages: &[Message]) -> Result<String, LlmError> {
        let prompt: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let topic = tagged(&prompt, "Report topic").unwrap_or("the topic");

        let value = if prompt.contains("\"SectionDraft\"") {
            Self::section_draft(&prompt)
        } else if prompt.contains("\"SectionPlan\"") {
            Self::section_plan(&prompt, topic)
        } else if prompt.contains("\"QueryPlan\"") {
            let n = captured_count(&QUERY_COUNT, &prompt, 3);
            let queries: Vec<Value> = (1..=n)
                .map(|i| json!({ "search_query": format!("{topic} key concept {i}") }))
                .collect();
            json!({ "queries": queries })
        } else {
            return Ok("OK".to_string());
        };

        Ok(format!("```json\n{}\n```", value))
    }

    fn section_plan(prompt: &str, topic: &str) -> Value {
        let n = captured_count(&SECTION_COUNT, prompt, 6);
        let subs = captured_count(&SUBSECTION_COUNT, prompt, 6);
        let sections: Vec<Value> = (1..=n)
            .map(|i| {
                let titles: Vec<String> = (1..=subs)
                    .map(|j| format!("{topic} part {i}.{j}"))
                    .collect();
                json!({
                    "name": format!("{topic}: module {i}"),
                    "description": format!("Core ideas of module {i} in {topic}"),
                    "subsection_titles": titles,
                })
            })
            .collect();
        json!({ "sections": sections })
    }

    fn section_draft(prompt: &str) -> Value {
        let title = tagged(prompt, "Section title").unwrap_or("Section");
        let titles: Vec<&str> = tagged(prompt, "Subsection titles")
            .map(|block| {
                block
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut sections = Map::new();
        for (i, sub) in titles.iter().enumerate() {
            sections.insert(
                format!("subsection{}", i + 1),
                json!({
                    "title": sub,
                    "description": format!("What {sub} covers"),
                    "content": format!("**{sub}** relies on ratios such as \\frac{{a}}{{b}} and sums like \\sum_{{i=1}}^{{n}} x_i."),
                    "sources": [{ "title": format!("Notes on {sub}"), "url": format!("https://example.com/{}", i + 1) }],
                }),
            );
        }

        json!({
            "mainText": format!("**{title}** in brief. Key identity: \\frac{{1}}{{2}}."),
            "sections": Value::Object(sections),
        })
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.respond(messages)
    }
}

type Responder = dyn Fn(usize, &[Message]) -> Result<String, LlmError> + Send + Sync;

/// 脚本化客户端：闭包收到 (调用序号, 消息)，返回本次结果
pub struct ScriptedLlmClient {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(usize, &[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// 已发生的调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(n, messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_extracts_block() {
        let text = "x <Section title>\nVectors\n</Section title> y";
        assert_eq!(tagged(text, "Section title"), Some("Vectors"));
        assert_eq!(tagged(text, "Missing"), None);
    }

    #[test]
    fn test_mock_plans_requested_counts() {
        let prompt = "<Report topic>\nLinear Algebra\n</Report topic>\n\"SectionPlan\"\nGenerate a list of 2 main sections. A list of 6 titles for subsections.";
        let out = MockLlmClient.respond(&[Message::system(prompt)]).unwrap();
        let body = out.trim_start_matches("```json").trim_end_matches("```");
        let value: Value = serde_json::from_str(body.trim()).unwrap();
        let sections = value["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0]["subsection_titles"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_scripted_counts_calls() {
        let client = ScriptedLlmClient::new(|n, _| Ok(format!("call {n}")));
        assert_eq!(client.complete(&[]).await.unwrap(), "call 0");
        assert_eq!(client.complete(&[]).await.unwrap(), "call 1");
        assert_eq!(client.calls(), 2);
    }
}
