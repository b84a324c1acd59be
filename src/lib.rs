//! Deep Research - 多章节研究报告生成引擎
//!
//! 模块划分：
//! - **agents**: 阶段 Agent（Planner、Searcher、Writer）与提示词
//! - **codec**: 安全结构化文本编解码（LaTeX 等反斜杠密集文本穿越 JSON）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态模型、编排器、恢复引擎、会话生命周期与监管
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **report**: 已完成章节渲染为 Markdown
//! - **search**: 检索后端（Tavily / Mock）与来源格式化
//! - **store**: 会话存储（内存 / 文件 / SQLite）

pub mod agents;
pub mod codec;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod report;
pub mod search;
pub mod store;

pub use crate::core::{ResearchError, ResearchRequest, ResearchService, ResearchServiceBuilder};
