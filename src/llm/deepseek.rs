//! DeepSeek 预设：OpenAI 兼容端点，模型与端点按 [llm] 段解析

use crate::config::LlmSection;
use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
/// 思考模式；章节撰写输出长，需配合更长的 `[llm.timeouts].request`
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// `DEEPSEEK_API_KEY` 优先，其次 `OPENAI_API_KEY`
pub fn deepseek_api_key() -> Option<String> {
    std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
}

/// 模型优先级：`[llm.deepseek].model` > `DEEPSEEK_MODEL` > `[llm].model`（非空时）> deepseek-chat
pub fn resolve_model(cfg: &LlmSection, env_model: Option<String>) -> String {
    cfg.deepseek
        .model
        .clone()
        .or(env_model)
        .or_else(|| Some(cfg.model.clone()).filter(|m| !m.trim().is_empty()))
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string())
}

pub fn create_deepseek_client(cfg: &LlmSection) -> OpenAiClient {
    let model = resolve_model(cfg, std::env::var("DEEPSEEK_MODEL").ok());
    let base_url = match (cfg.provider.as_str(), cfg.base_url.as_deref()) {
        ("deepseek", Some(url)) => url,
        _ => DEEPSEEK_BASE_URL,
    };
    tracing::info!(model = %model, base_url = %base_url, "Using DeepSeek LLM");
    OpenAiClient::new(Some(base_url), &model, deepseek_api_key().as_deref())
}
