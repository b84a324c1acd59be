//! 安全结构化文本编解码
//!
//! 模型生成的章节内容常带 LaTeX（`\frac`、`\alpha`、`\(x\)`），直接走 JSON 解析时
//! 反斜杠要么构成非法转义导致解析失败，要么被悄悄当成 `\f`、`\b` 等控制字符。
//!
//! - `encode`：serde_json 序列化，字符串叶子中每个反斜杠写成两个，标准 JSON 解码即可还原原始个数
//! - `decode`：先严格解析；失败后做一次修复（未转义的反斜杠加倍）再解析；仍失败返回
//!   `Decoded::Failed` 哨兵值，从不 panic、从不返回 Err
//! - `decode_model_output`：从模型回复中抽取候选 JSON 片段（```json 代码块、延伸到最后一个
//!   围栏的代码块、最外层括号）依次解码，取第一个成功的

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid regex"));
/// 字符串值里嵌有 Markdown 代码块时，闭合围栏取最后一个
static FENCED_JSON_OUTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*)```").expect("valid regex"));

/// 解码失败哨兵：可恢复但为空的结果，调用方不得将其当作报告内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecFailure {
    pub cause: String,
    /// 原始文本不随哨兵保留
    pub raw_preserved: bool,
}

impl CodecFailure {
    fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            raw_preserved: false,
        }
    }
}

impl std::fmt::Display for CodecFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "codec failure: {}", self.cause)
    }
}

/// 解码结果：成功的 JSON 值，或失败哨兵
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(Value),
    Failed(CodecFailure),
}

impl Decoded {
    pub fn is_failed(&self) -> bool {
        matches!(self, Decoded::Failed(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Decoded::Value(v) => Some(v),
            Decoded::Failed(_) => None,
        }
    }
}

/// 编码为 JSON 文本；字符串叶子中的反斜杠与引号按 JSON 规则转义
pub fn encode(value: &Value) -> String {
    value.to_string()
}

/// 序列化任意可序列化类型后编码
pub fn encode_as<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

/// 两阶段解码：严格解析 → 反斜杠修复后重试 → 失败哨兵
pub fn decode(raw: &str) -> Decoded {
    let first = match serde_json::from_str::<Value>(raw) {
        Ok(v) => return Decoded::Value(v),
        Err(e) => e,
    };

    let repaired = repair_backslashes(raw);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(v) => {
            tracing::debug!("JSON recovered after backslash repair ({})", first);
            Decoded::Value(v)
        }
        Err(second) => Decoded::Failed(CodecFailure::new(format!(
            "{first}; after backslash repair: {second}"
        ))),
    }
}

/// 将未转义的反斜杠加倍；已成对的 `\\` 与字符串定界用的 `\"` 保持不变
fn repair_backslashes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + raw.len() / 8);
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('\\') => {
                out.push_str("\\\\");
                chars.next();
            }
            Some('"') => out.push('\\'),
            _ => out.push_str("\\\\"),
        }
    }
    out
}

/// 从模型回复中抽取 JSON 片段：优先 ```json 代码块，其次最外层 {...} / [...]
pub fn extract_json_payload(text: &str) -> &str {
    json_payload_candidates(text)
        .into_iter()
        .next()
        .unwrap_or_else(|| text.trim())
}

fn push_candidate<'a>(candidates: &mut Vec<&'a str>, candidate: &'a str) {
    let candidate = candidate.trim();
    if !candidate.is_empty() && !candidates.contains(&candidate) {
        candidates.push(candidate);
    }
}

/// 候选片段，按优先级排列且去重
fn json_payload_candidates(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    let mut candidates = Vec::new();
    for re in [&*FENCED_JSON, &*FENCED_JSON_OUTER] {
        if let Some(block) = re.captures(trimmed).and_then(|c| c.get(1)) {
            push_candidate(&mut candidates, block.as_str());
        }
    }

    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    if let (Some(s), Some(e)) = (start, end) {
        if e > s {
            push_candidate(&mut candidates, &trimmed[s..=e]);
        }
    }
    candidates
}

/// 解码模型回复文本；所有候选都失败时返回首个候选的失败哨兵
pub fn decode_model_output(text: &str) -> Decoded {
    let mut first_failure = None;
    for candidate in json_payload_candidates(text) {
        match decode(candidate) {
            Decoded::Value(v) => return Decoded::Value(v),
            failed => {
                first_failure.get_or_insert(failed);
            }
        }
    }
    first_failure.unwrap_or_else(|| decode(text.trim()))
}

/// 将解码结果转换为目标结构；形状不符同样归为 CodecFailure
pub fn decode_as<T: DeserializeOwned>(decoded: Decoded) -> Result<T, CodecFailure> {
    match decoded {
        Decoded::Value(v) => serde_json::from_value(v)
            .map_err(|e| CodecFailure::new(format!("shape mismatch: {e}"))),
        Decoded::Failed(f) => Err(f),
    }
}

/// decode + decode_as
pub fn decode_into<T: DeserializeOwned>(raw: &str) -> Result<T, CodecFailure> {
    decode_as(decode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(s: &str) -> Value {
        decode(&encode(&Value::String(s.to_string())))
            .into_value()
            .expect("encoded text always decodes")
    }

    #[test]
    fn test_frac_survives_standard_json() {
        let original = "\\frac{1}{2}";
        let encoded = encode(&json!(original));
        assert_eq!(encoded, r#""\\frac{1}{2}""#);

        let parsed: String = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed, original);
        // 再经过一层标准 stringify/parse（传输层）依旧不变
        let transported: String =
            serde_json::from_str(&serde_json::to_string(&parsed).unwrap()).unwrap();
        assert_eq!(transported, original);
    }

    #[test]
    fn test_roundtrip_markup_heavy_strings() {
        let samples = [
            "",
            "plain text",
            "\\",
            "\\\\",
            "\\\\\\",
            "ends with backslash \\",
            "quote \" inside",
            "\\\"escaped quote\\\"",
            "$$\\sum_{i=1}^{n} \\alpha_i \\cdot \\vec{v}_i$$",
            "\\begin{bmatrix} 1 & 0 \\\\ 0 & 1 \\end{bmatrix}",
            "\\(x^2\\) and \\[y\\]",
            "tabs\tand\nnewlines\r\n",
            "\u{0001}control\u{001f}",
            "unicode ∑ λ 线性代数",
        ];
        for s in samples {
            assert_eq!(roundtrip(s), Value::String(s.to_string()), "sample {s:?}");
        }
    }

    #[test]
    fn test_roundtrip_small_alphabet_exhaustive() {
        let alphabet = ['\\', '"', 'n', '{', '\n'];
        let mut words = vec![String::new()];
        for _ in 0..4 {
            let next: Vec<String> = words
                .iter()
                .flat_map(|w| alphabet.iter().map(move |c| format!("{w}{c}")))
                .collect();
            for w in &next {
                assert_eq!(roundtrip(w), Value::String(w.clone()), "word {w:?}");
            }
            words = next;
        }
    }

    #[test]
    fn test_non_string_leaves_unchanged() {
        let value = json!({
            "n": 1.5,
            "flag": true,
            "none": null,
            "list": [1, "a\\b", {"k": -3}],
        });
        let encoded = encode(&value);
        assert_eq!(serde_json::from_str::<Value>(&encoded).unwrap(), value);
        assert_eq!(decode(&encoded), Decoded::Value(value));
    }

    #[test]
    fn test_repair_recovers_unescaped_latex() {
        // \( 是非法转义，严格解析失败；修复后得到原始 LaTeX
        let raw = r#"{"body": "Area is \(\pi r^2\)"}"#;
        assert!(serde_json::from_str::<Value>(raw).is_err());

        let value = decode(raw).into_value().unwrap();
        assert_eq!(value["body"], json!("Area is \\(\\pi r^2\\)"));
    }

    #[test]
    fn test_repair_keeps_escaped_pairs_and_quotes() {
        let raw = r#"{"a": "\\frac{1}{2} \alpha", "b": "say \"hi\""}"#;
        let value = decode(raw).into_value().unwrap();
        assert_eq!(value["a"], json!("\\frac{1}{2} \\alpha"));
        assert_eq!(value["b"], json!("say \"hi\""));
    }

    #[test]
    fn test_failure_sentinel_instead_of_error() {
        match decode("{\"sections\": [unterminated") {
            Decoded::Failed(f) => {
                assert!(!f.raw_preserved);
                assert!(f.cause.contains("after backslash repair"));
            }
            other => panic!("expected failure sentinel, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_payload_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json_payload(reply), "{\"a\": 1}");

        let bare = "Sure! {\"a\": [1, 2]} done";
        assert_eq!(extract_json_payload(bare), "{\"a\": [1, 2]}");

        assert_eq!(extract_json_payload("no json here"), "no json here");
    }

    #[test]
    fn test_fenced_reply_with_embedded_code_block() {
        let reply = "```json\n{\"body\": \"Example:\\n```python\\nprint(1)\\n```\\ndone\"}\n```";
        let value = decode_model_output(reply).into_value().unwrap();
        assert_eq!(value["body"], json!("Example:\n```python\nprint(1)\n```\ndone"));
    }

    #[test]
    fn test_model_output_failure_keeps_sentinel() {
        match decode_model_output("```json\n{\"a\": [1,\n```") {
            Decoded::Failed(f) => assert!(f.cause.contains("after backslash repair")),
            other => panic!("expected failure sentinel, got {other:?}"),
        }
        assert!(decode_model_output("no json here").is_failed());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Shape {
        title: String,
    }

    #[test]
    fn test_decode_as_reports_shape_mismatch() {
        let ok: Shape = decode_into(r#"{"title": "\frac"}"#).unwrap();
        // \f 是合法 JSON 转义（换页符），严格解析即成功
        assert_eq!(ok.title, "\u{000c}rac");

        let err = decode_into::<Shape>(r#"{"name": "x"}"#).unwrap_err();
        assert!(err.cause.starts_with("shape mismatch"));
    }
}
