//! 研究流水线错误类型与恢复动作
//!
//! Agent 只返回 `PhaseError`；由 RecoveryEngine 决定重试还是转为致命的 `ResearchError`。

use thiserror::Error;

use crate::core::state::StateError;
use crate::store::StoreError;

/// 会话级错误；除 Interrupted 外都会把会话置为 error
#[derive(Error, Debug)]
pub enum ResearchError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Search exhausted for section '{section}': {cause}")]
    SearchExhausted { section: String, cause: String },

    #[error("Write failed for section '{section}': {cause}")]
    Write { section: String, cause: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Invalid state transition: {0}")]
    State(#[from] StateError),

    /// 取消或超出运行时长预算；会话保持 running，等待续跑
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl ResearchError {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResearchError::Interrupted(_))
    }
}

/// 单个阶段 Agent 的失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("All {attempted} search queries failed: {last_error}")]
    AllQueriesFailed { attempted: usize, last_error: String },

    #[error("Write error: {0}")]
    Write(String),
}

/// 恢复引擎对 PhaseError 的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 同一章节重新进入 RESEARCHING
    RetrySection,
    /// 用扩大后的检索词再检索一次
    WidenQueries,
    /// 预算耗尽或不可重试
    Fail,
}
