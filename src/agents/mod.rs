//! 阶段 Agent：Planner、Searcher、Writer
//!
//! 每个 Agent 是无状态变换：读取 ResearchState，调用一种外部能力，返回 `AgentOutput`
//! （待应用的 StatePatch + 审计摘要）或 PhaseError。不持久化、不循环，重试由编排器决定。

pub mod planner;
pub mod prompts;
pub mod queries;
pub mod searcher;
pub mod writer;

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::codec::{self, CodecFailure};
use crate::core::state::StatePatch;
use crate::llm::{LlmClient, LlmError, Message};

pub use planner::{Planner, PlannerSettings};
pub use queries::{section_queries, widened_queries};
pub use searcher::Searcher;
pub use writer::Writer;

/// Agent 成功输出
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub patch: StatePatch,
    /// 写入 PhaseResult.summary
    pub audit: String,
}

/// 结构化生成失败
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("capability call failed: {0}")]
    Capability(#[from] LlmError),

    #[error("unusable output: {}", .0.cause)]
    Unusable(CodecFailure),
}

/// 目标结构的 JSON Schema（schemars）
pub(crate) fn schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 请求一次结构化输出：提示词末尾附上 T 的 Schema，回复经 codec 解码为 T
pub(crate) async fn generate<T>(
    llm: &dyn LlmClient,
    system: &str,
    prompt: &str,
) -> Result<T, GenerateError>
where
    T: JsonSchema + DeserializeOwned,
{
    let user = format!("{prompt}\n\n{}", prompts::output_contract(&schema_json::<T>()));
    let messages = [Message::system(system), Message::user(user)];
    let reply = llm.complete(&messages).await?;
    codec::decode_as(codec::decode_model_output(&reply)).map_err(GenerateError::Unusable)
}
