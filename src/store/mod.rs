//! 会话存储：唯一接触持久化的组件
//!
//! 所有写入按会话 id 定位；`apply_phase_result` 按审计键幂等。
//! 后端：内存、文件（每会话一个 JSON 文档）、SQLite（需启用 async-sqlite feature）。

pub mod file;
pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreSection;
use crate::core::state::{
    Checkpoint, PhaseResult, ResearchRequest, ResearchState, Session, SessionStatus, StateError,
};

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteSessionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    /// 违反会话状态约束（如对已结束的会话写入）
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "async-sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StateError> for StoreError {
    fn from(e: StateError) -> Self {
        StoreError::Conflict(e.to_string())
    }
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 创建会话（status=running, phase=PLANNING）
    async fn create_session(&self, request: &ResearchRequest) -> Result<Session, StoreError>;

    /// 写入阶段审计记录并替换状态检查点
    async fn apply_phase_result(
        &self,
        session_id: &str,
        result: PhaseResult,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError>;

    /// 标记完成；已完成章节数不等于目标时返回 Conflict
    async fn complete_session(
        &self,
        session_id: &str,
        final_state: &ResearchState,
    ) -> Result<(), StoreError>;

    async fn fail_session(&self, session_id: &str, message: &str) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    async fn heartbeat(&self, session_id: &str) -> Result<(), StoreError>;

    /// 按状态列出会话（None 为全部），按创建时间升序
    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError>;

    fn name(&self) -> &'static str;
}

fn default_store_path(backend: &str) -> PathBuf {
    match backend {
        "sqlite" => PathBuf::from("research_sessions.db"),
        _ => PathBuf::from("research_sessions"),
    }
}

/// 按 [store] 配置创建会话存储；持久化后端不可用时回退到内存存储
pub async fn create_session_store(cfg: &StoreSection) -> Arc<dyn SessionStore> {
    let path = cfg
        .path
        .clone()
        .unwrap_or_else(|| default_store_path(&cfg.backend));

    match cfg.backend.as_str() {
        "memory" => {}
        "file" => match FileSessionStore::open(&path).await {
            Ok(store) => {
                tracing::info!("Using file session store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open file store, falling back to memory: {}", e);
            }
        },
        #[cfg(feature = "async-sqlite")]
        "sqlite" => match SqliteSessionStore::new(&path).await {
            Ok(store) => {
                tracing::info!("Using sqlite session store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite store, falling back to memory: {}", e);
            }
        },
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => {
            tracing::warn!(
                "Sqlite session store requested but async-sqlite feature not enabled, using memory store"
            );
        }
        other => {
            tracing::warn!("Unknown store backend '{}', using memory store", other);
        }
    }

    tracing::info!("Using in-memory session store (sessions will not survive restarts)");
    Arc::new(MemorySessionStore::new())
}
