//! SQLite 会话存储（sqlx，需启用 `async-sqlite` feature）
//!
//! 阶段、状态检查点、心跳各自独立更新；审计表以 (session_id, key) 为主键，
//! `INSERT OR REPLACE` 保证同一审计键重复写入幂等。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{SessionStore, StoreError};
use crate::codec;
use crate::core::state::{
    now_millis, Checkpoint, Phase, PhaseResult, ResearchRequest, ResearchState, Session,
    SessionStatus,
};

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS research_sessions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                query TEXT NOT NULL,
                target_section_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                current_phase TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_heartbeat INTEGER,
                error TEXT,
                state TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS research_phase_results (
                session_id TEXT NOT NULL,
                key TEXT NOT NULL,
                phase TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                summary TEXT NOT NULL,
                PRIMARY KEY (session_id, key),
                FOREIGN KEY (session_id) REFERENCES research_sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_research_sessions_status ON research_sessions(status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn status_of(&self, session_id: &str) -> Result<SessionStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM research_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        parse_column(&row.get::<String, _>("status"))
    }

    fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
        let state: ResearchState = codec::decode_into(&row.get::<String, _>("state"))
            .map_err(|f| StoreError::Serialization(f.cause))?;
        Ok(Session {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            query: row.get("query"),
            target_section_count: row.get::<i64, _>("target_section_count") as usize,
            status: parse_column(&row.get::<String, _>("status"))?,
            current_phase: parse_column(&row.get::<String, _>("current_phase"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_heartbeat: row.get("last_heartbeat"),
            error: row.get("error"),
            state,
            phase_results: Default::default(),
        })
    }

    async fn load_phase_results(&self, session: &mut Session) -> Result<(), StoreError> {
        let rows = sqlx::query(
            "SELECT key, phase, timestamp, summary FROM research_phase_results WHERE session_id = ?",
        )
        .bind(&session.id)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let result = PhaseResult {
                phase: parse_column(&row.get::<String, _>("phase"))?,
                key: row.get("key"),
                timestamp: row.get("timestamp"),
                summary: row.get("summary"),
            };
            session.phase_results.insert(result.key.clone(), result);
        }
        Ok(())
    }
}

fn parse_column<T>(raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Serialization(e.to_string()))
}

fn encode_state(state: &ResearchState) -> Result<String, StoreError> {
    codec::encode_as(state).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, request: &ResearchRequest) -> Result<Session, StoreError> {
        let session = Session::new(request);
        sqlx::query(
            "INSERT INTO research_sessions
                (id, owner_id, query, target_section_count, status, current_phase, created_at, updated_at, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(&session.query)
        .bind(session.target_section_count as i64)
        .bind(session.status.as_str())
        .bind(session.current_phase.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(encode_state(&session.state)?)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    async fn apply_phase_result(
        &self,
        session_id: &str,
        result: PhaseResult,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        let status = self.status_of(session_id).await?;
        if status != SessionStatus::Running {
            return Err(StoreError::Conflict(format!("Session is already {status}")));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO research_phase_results (session_id, key, phase, timestamp, summary)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&result.key)
        .bind(result.phase.as_str())
        .bind(result.timestamp)
        .bind(&result.summary)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE research_sessions SET state = ?, current_phase = ?, updated_at = ? WHERE id = ?",
        )
        .bind(encode_state(&checkpoint.state)?)
        .bind(checkpoint.phase.as_str())
        .bind(now_millis())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: &str,
        final_state: &ResearchState,
    ) -> Result<(), StoreError> {
        let mut session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.mark_completed(final_state.clone())?;

        sqlx::query(
            "UPDATE research_sessions SET status = ?, current_phase = ?, state = ?, updated_at = ? WHERE id = ?",
        )
        .bind(session.status.as_str())
        .bind(Phase::Completed.as_str())
        .bind(encode_state(&session.state)?)
        .bind(session.updated_at)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_session(&self, session_id: &str, message: &str) -> Result<(), StoreError> {
        let status = self.status_of(session_id).await?;
        if status == SessionStatus::Completed {
            return Err(StoreError::Conflict(format!("Session is already {status}")));
        }

        sqlx::query(
            "UPDATE research_sessions SET status = ?, current_phase = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(SessionStatus::Error.as_str())
        .bind(Phase::Error.as_str())
        .bind(message)
        .bind(now_millis())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM research_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut session = Self::session_from_row(&row)?;
        self.load_phase_results(&mut session).await?;
        Ok(Some(session))
    }

    async fn heartbeat(&self, session_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE research_sessions SET last_heartbeat = ? WHERE id = ?")
            .bind(now_millis())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = match status {
            Some(st) => {
                sqlx::query("SELECT * FROM research_sessions WHERE status = ? ORDER BY created_at")
                    .bind(st.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM research_sessions ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut session = Self::session_from_row(row)?;
            self.load_phase_results(&mut session).await?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
