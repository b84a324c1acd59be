//! 内存会话存储（进程退出即丢失，用于测试与无持久化部署）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SessionStore, StoreError};
use crate::core::state::{
    Checkpoint, PhaseResult, ResearchRequest, ResearchState, Session, SessionStatus, StateError,
};

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在写锁内修改单个会话
    async fn update<F>(&self, session_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Session) -> Result<(), StateError> + Send,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        f(session)?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, request: &ResearchRequest) -> Result<Session, StoreError> {
        let session = Session::new(request);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn apply_phase_result(
        &self,
        session_id: &str,
        result: PhaseResult,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        self.update(session_id, |s| s.record_phase(result, checkpoint))
            .await
    }

    async fn complete_session(
        &self,
        session_id: &str,
        final_state: &ResearchState,
    ) -> Result<(), StoreError> {
        let final_state = final_state.clone();
        self.update(session_id, |s| s.mark_completed(final_state))
            .await
    }

    async fn fail_session(&self, session_id: &str, message: &str) -> Result<(), StoreError> {
        self.update(session_id, |s| s.mark_failed(message)).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn heartbeat(&self, session_id: &str) -> Result<(), StoreError> {
        self.update(session_id, |s| {
            s.touch_heartbeat();
            Ok(())
        })
        .await
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
