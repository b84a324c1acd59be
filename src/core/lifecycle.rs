//! 会话生命周期：校验请求、创建会话、在受监管的后台任务中运行编排器、落定终态
//!
//! 调用方总能拿到 session id；失败只体现在会话文档的 `error` 字段。
//! 后台任务 panic 或被中止时，外层监管任务同样调用 `fail_session`。
//! 同一会话在本进程内最多只有一条流水线在跑（在途登记表）。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::error::ResearchError;
use crate::core::orchestrator::Orchestrator;
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::{ResearchRequest, ResearchState, Session, SessionStatus};
use crate::store::SessionStore;

/// 提交后立即返回的句柄
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// 等待后台任务结束（终态已写入存储）
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            tracing::error!(session_id = %self.session_id, "Supervisor task failed: {}", e);
        }
    }
}

/// 本进程内正在运行的会话 id
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记会话；已在运行时返回 None
    fn claim(&self, session_id: &str) -> Option<InFlightGuard> {
        if !self.ids().insert(session_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            session_id: session_id.to_string(),
            registry: self.clone(),
        })
    }

    fn contains(&self, session_id: &str) -> bool {
        self.ids().contains(session_id)
    }
}

/// 监管任务结束（含 panic 路径）时注销
struct InFlightGuard {
    session_id: String,
    registry: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.ids().remove(&self.session_id);
    }
}

#[derive(Clone)]
pub struct ResearchService {
    store: Arc<dyn SessionStore>,
    orchestrator: Arc<Orchestrator>,
    max_section_count: usize,
    heartbeat: Duration,
    max_runtime: Option<Duration>,
    shutdown: CancellationToken,
    in_flight: InFlight,
}

impl ResearchService {
    pub fn new(store: Arc<dyn SessionStore>, orchestrator: Orchestrator, cfg: &AppConfig) -> Self {
        Self {
            store,
            orchestrator: Arc::new(orchestrator),
            max_section_count: cfg.research.max_section_count,
            heartbeat: Duration::from_secs(cfg.store.heartbeat_secs.max(1)),
            max_runtime: cfg.store.max_runtime_secs.map(Duration::from_secs),
            shutdown: CancellationToken::new(),
            in_flight: InFlight::default(),
        }
    }

    /// 外部关闭 token（Ctrl+C / SIGTERM），会级联取消所有会话
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_max_runtime(mut self, budget: Option<Duration>) -> Self {
        self.max_runtime = budget;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// 校验并规范化请求（去除主题首尾空白）
    pub fn validate(&self, request: &ResearchRequest) -> Result<ResearchRequest, ResearchError> {
        let topic = request.topic.trim();
        if topic.is_empty() {
            return Err(ResearchError::Validation("topic must not be empty".to_string()));
        }
        let owner_id = request.owner_id.trim();
        if owner_id.is_empty() {
            return Err(ResearchError::Validation("owner_id must not be empty".to_string()));
        }
        let count = request.target_section_count;
        if count == 0 || count > self.max_section_count {
            return Err(ResearchError::Validation(format!(
                "target_section_count must be between 1 and {}, got {count}",
                self.max_section_count
            )));
        }
        Ok(ResearchRequest::new(topic, count, owner_id))
    }

    /// 校验、创建会话并在后台启动流水线
    pub async fn submit(&self, request: ResearchRequest) -> Result<SessionHandle, ResearchError> {
        let request = self.validate(&request)?;
        let session = self.store.create_session(&request).await?;
        tracing::info!(
            session_id = %session.id,
            owner_id = %session.owner_id,
            topic = %session.query,
            sections = session.target_section_count,
            "Research session created"
        );
        let guard = self.claim(&session.id)?;
        Ok(self.spawn_supervised(session, guard))
    }

    /// 本进程内该会话是否仍有流水线在跑
    pub fn is_running(&self, session_id: &str) -> bool {
        self.in_flight.contains(session_id)
    }

    fn claim(&self, session_id: &str) -> Result<InFlightGuard, ResearchError> {
        self.in_flight.claim(session_id).ok_or_else(|| {
            ResearchError::Validation(format!("session {session_id} is already running"))
        })
    }

    /// 从最后一个检查点续跑 running 状态的会话
    pub async fn resume(&self, session_id: &str) -> Result<SessionHandle, ResearchError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ResearchError::Validation(format!("unknown session {session_id}")))?;
        if session.status != SessionStatus::Running {
            return Err(ResearchError::Validation(format!(
                "session {session_id} is already {}",
                session.status
            )));
        }
        let guard = self.claim(&session.id)?;
        tracing::info!(
            session_id = %session.id,
            phase = %session.state.resume_phase(),
            completed = session.state.completed_count(),
            "Resuming research session"
        );
        Ok(self.spawn_supervised(session, guard))
    }

    /// 进程重启后续跑所有 running 会话；本进程内已在跑的会话跳过
    pub async fn resume_incomplete(&self) -> Result<Vec<SessionHandle>, ResearchError> {
        let sessions = self.store.list_sessions(Some(SessionStatus::Running)).await?;
        tracing::info!("Found {} incomplete sessions", sessions.len());
        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            match self.claim(&session.id) {
                Ok(guard) => handles.push(self.spawn_supervised(session, guard)),
                Err(e) => tracing::info!(session_id = %session.id, "Skipped: {}", e),
            }
        }
        Ok(handles)
    }

    /// 内层任务跑流水线；外层任务监管其 JoinError（panic / abort）并写入 error
    fn spawn_supervised(&self, session: Session, guard: InFlightGuard) -> SessionHandle {
        let session_id = session.id.clone();
        let service = self.clone();
        let span = crate::observability::session_span(&session_id);
        let inner = tokio::spawn(
            async move {
                let _ = service.run_to_completion(session).await;
            }
            .instrument(span),
        );

        let store = self.store.clone();
        let id = session_id.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            if let Err(join_err) = inner.await {
                let message = if join_err.is_panic() {
                    "pipeline task panicked"
                } else {
                    "pipeline task was aborted"
                };
                tracing::error!(session_id = %id, "{}", message);
                if let Err(e) = store.fail_session(&id, message).await {
                    tracing::error!(session_id = %id, "Failed to record failure: {}", e);
                }
            }
        });

        SessionHandle { session_id, task }
    }

    /// 在当前任务中运行会话直到终态或中断，并把结果写回存储
    pub async fn run_to_completion(&self, session: Session) -> Result<ResearchState, ResearchError> {
        let supervisor = SessionSupervisor::new(session.id.clone(), &self.shutdown);
        let heartbeat = supervisor.spawn_heartbeat(self.store.clone(), self.heartbeat);
        let cancel = supervisor.cancel_token();

        let run = self.orchestrator.run(&session.id, session.state.clone(), &cancel);
        let result = match self.max_runtime {
            Some(budget) => match tokio::time::timeout(budget, run).await {
                Ok(result) => result,
                Err(_) => Err(ResearchError::Interrupted(format!(
                    "runtime budget of {}s exceeded",
                    budget.as_secs()
                ))),
            },
            None => run.await,
        };

        supervisor.cancel();
        let _ = heartbeat.await;
        self.reconcile(&session.id, result).await
    }

    async fn reconcile(
        &self,
        session_id: &str,
        result: Result<ResearchState, ResearchError>,
    ) -> Result<ResearchState, ResearchError> {
        let err = match result {
            Ok(state) => match self.store.complete_session(session_id, &state).await {
                Ok(()) => {
                    tracing::info!(session_id = %session_id, "Research session completed");
                    return Ok(state);
                }
                Err(e) => ResearchError::from(e),
            },
            Err(e) if !e.is_terminal() => {
                tracing::warn!(session_id = %session_id, "{}; session left running for resume", e);
                return Err(e);
            }
            Err(e) => e,
        };

        tracing::error!(session_id = %session_id, "Research session failed: {}", err);
        if let Err(store_err) = self.store.fail_session(session_id, &err.to_string()).await {
            tracing::error!(session_id = %session_id, "Failed to record failure: {}", store_err);
        }
        Err(err)
    }
}
