//! 文件会话存储：每个会话一个 JSON 文档 `<dir>/<id>.json`
//!
//! 文档经 codec 编码（模型生成的 LaTeX 反斜杠原样保留），先写临时文件再 rename，
//! 进程中途退出不会留下半截文档。读-改-写由一把异步互斥锁串行化。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{SessionStore, StoreError};
use crate::codec;
use crate::core::state::{
    Checkpoint, PhaseResult, ResearchRequest, ResearchState, Session, SessionStatus, StateError,
};

#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// 打开（必要时创建）存储目录
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// 会话 id 只允许出现在文件名中
    fn document_path(&self, session_id: &str) -> Option<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{session_id}.json")))
    }

    async fn read_document(&self, path: &Path) -> Result<Option<Session>, StoreError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        codec::decode_into::<Session>(&raw)
            .map(Some)
            .map_err(|f| StoreError::Serialization(format!("{}: {}", path.display(), f.cause)))
    }

    async fn write_document(&self, session: &Session) -> Result<(), StoreError> {
        let path = self
            .document_path(&session.id)
            .ok_or_else(|| StoreError::NotFound(session.id.clone()))?;
        let encoded =
            codec::encode_as(session).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn update<F>(&self, session_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Session) -> Result<(), StateError> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let path = self
            .document_path(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let mut session = self
            .read_document(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        f(&mut session)?;
        self.write_document(&session).await
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(&self, request: &ResearchRequest) -> Result<Session, StoreError> {
        let session = Session::new(request);
        let _guard = self.write_lock.lock().await;
        self.write_document(&session).await?;
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
        match self.document_path(session_id) {
            Some(path) => self.read_document(&path).await,
            None => Ok(None),
        }
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
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_document(&path).await {
                Ok(Some(session)) if status.map_or(true, |st| session.status == st) => {
                    sessions.push(session)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping unreadable session document: {}", e),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::state::{Phase, Section, SectionContent, StatePatch, Source, Subsection};

    fn written_state(topic: &str) -> ResearchState {
        let section = Section::new("Limits", "epsilon-delta", vec!["Definition".to_string()]);
        let mut subsections = BTreeMap::new();
        subsections.insert(
            "Definition".to_string(),
            Subsection {
                description: "formal".to_string(),
                body: "$$\\lim_{x \\to a} f(x) = L$$ and \\frac{1}{2}".to_string(),
                sources: vec![Source {
                    title: "Notes".to_string(),
                    url: "https://example.org/limits".to_string(),
                }],
            },
        );
        let content = SectionContent {
            overview: "\\(\\epsilon\\)-\\(\\delta\\)".to_string(),
            subsections,
        };
        ResearchState::new(topic, 1)
            .apply(StatePatch::Planned {
                sections: vec![section.clone()],
                queries: vec![],
            })
            .unwrap()
            .apply(StatePatch::Activated {
                section: section.clone(),
                queries: vec!["limits".to_string()],
            })
            .unwrap()
            .apply(StatePatch::Researched {
                evidence: "Sources:".to_string(),
            })
            .unwrap()
            .apply(StatePatch::Written {
                section: section.with_content(content),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_latex_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = {
            let store = FileSessionStore::open(dir.path()).await.unwrap();
            let session = store
                .create_session(&ResearchRequest::new("Calculus", 1, "u1"))
                .await
                .unwrap();
            let state = written_state("Calculus");
            let checkpoint = Checkpoint {
                phase: Phase::Completed,
                state: state.clone(),
            };
            store
                .apply_phase_result(&session.id, PhaseResult::new(Phase::Writing, 1, "Limits"), &checkpoint)
                .await
                .unwrap();
            store.complete_session(&session.id, &state).await.unwrap();
            session.id
        };

        let reopened = FileSessionStore::open(dir.path()).await.unwrap();
        let session = reopened.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.state, written_state("Calculus"));
        let body = &session.state.completed_sections[0]
            .content
            .as_ref()
            .unwrap()
            .subsections["Definition"]
            .body;
        assert!(body.contains("\\frac{1}{2}"));
        assert!(session.phase_results.contains_key("writing#1"));
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        store
            .create_session(&ResearchRequest::new("Topology", 2, "u1"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{\"id\": ").unwrap();

        let running = store.list_sessions(Some(SessionStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].query, "Topology");
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        assert!(store.get_session("../etc/passwd").await.unwrap().is_none());
        assert!(matches!(
            store.fail_session("../x", "boom").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
