//! 流水线编排器：PLANNING → RESEARCHING → WRITING → {RESEARCHING | COMPLETED}
//!
//! 每次转换后先经 SessionStore 写检查点，再向调用方推送 PhaseSnapshot，然后才进入下一阶段。
//! 入口阶段只由持久化状态推导（`ResearchState::resume_phase`），已有计划时绝不重新规划。
//! 取消是协作式的：在途阶段被放弃（Interrupted），会话保持 running。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::{section_queries, widened_queries, AgentOutput, Planner, Searcher, Writer};
use crate::core::error::{PhaseError, RecoveryAction, ResearchError};
use crate::core::recovery::{RecoveryEngine, SectionAttempts};
use crate::core::state::{
    Checkpoint, Phase, PhaseResult, PhaseSnapshot, ResearchState, SessionStatus, StateError,
    StatePatch,
};
use crate::store::SessionStore;

pub struct Orchestrator {
    planner: Planner,
    searcher: Searcher,
    writer: Writer,
    store: Arc<dyn SessionStore>,
    recovery: RecoveryEngine,
    /// 每个章节派生检索词的数量
    query_budget: usize,
    event_tx: Option<mpsc::UnboundedSender<PhaseSnapshot>>,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        searcher: Searcher,
        writer: Writer,
        store: Arc<dyn SessionStore>,
        recovery: RecoveryEngine,
        query_budget: usize,
    ) -> Self {
        Self {
            planner,
            searcher,
            writer,
            store,
            recovery,
            query_budget,
            event_tx: None,
        }
    }

    /// 订阅每次转换后的快照
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PhaseSnapshot>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 从 state 推导的入口阶段运行到 COMPLETED；返回最终状态
    pub async fn run(
        &self,
        session_id: &str,
        state: ResearchState,
        cancel: &CancellationToken,
    ) -> Result<ResearchState, ResearchError> {
        let mut state = state;
        let mut phase = state.resume_phase();
        let entry_phase = phase;
        let mut attempts = SectionAttempts::default();
        tracing::info!(
            session_id = %session_id,
            phase = %phase,
            completed = state.completed_count(),
            target = state.target_section_count,
            "Pipeline starting"
        );

        loop {
            match phase {
                Phase::Planning => {
                    let output = self.guard(cancel, phase, self.planner.plan(&state)).await?;
                    let output = output.map_err(|e| self.fatal(e, &state))?;
                    state = advance(state, output.patch)?;
                    state = self.activate_next(state)?;
                    phase = Phase::Researching;
                    self.checkpoint(session_id, PhaseResult::new(Phase::Planning, 0, output.audit), phase, &state)
                        .await?;
                }
                Phase::Researching => {
                    if state.active_section.is_none() {
                        state = self.activate_next(state)?;
                    }
                    let ordinal = state.section_ordinal();
                    match self.guard(cancel, phase, self.searcher.research(&state)).await? {
                        Ok(output) => {
                            state = advance(state, output.patch)?;
                            phase = Phase::Writing;
                            self.checkpoint(
                                session_id,
                                PhaseResult::new(Phase::Researching, ordinal, output.audit),
                                phase,
                                &state,
                            )
                            .await?;
                        }
                        Err(e) => {
                            let queries = self.recover(&e, &mut attempts, &state)?;
                            state = advance(state, StatePatch::Requeued { queries })?;
                            let summary = format!("{e}; retrying with widened queries");
                            self.checkpoint(
                                session_id,
                                PhaseResult::new(Phase::Researching, ordinal, summary),
                                phase,
                                &state,
                            )
                            .await?;
                        }
                    }
                }
                Phase::Writing => {
                    let ordinal = state.section_ordinal();
                    match self.guard(cancel, phase, self.writer.write(&state)).await? {
                        Ok(AgentOutput { patch, audit }) => {
                            state = advance(state, patch)?;
                            attempts = SectionAttempts::default();
                            phase = if state.is_complete() {
                                Phase::Completed
                            } else {
                                state = self.activate_next(state)?;
                                Phase::Researching
                            };
                            self.checkpoint(session_id, PhaseResult::new(Phase::Writing, ordinal, audit), phase, &state)
                                .await?;
                        }
                        Err(e) => {
                            let queries = self.recover(&e, &mut attempts, &state)?;
                            state = advance(state, StatePatch::Requeued { queries })?;
                            phase = Phase::Researching;
                            let summary = format!(
                                "{e}; researching again (retry {}/{})",
                                attempts.write_retries,
                                self.recovery.max_write_retries()
                            );
                            self.checkpoint(
                                session_id,
                                PhaseResult::new(Phase::Writing, ordinal, summary),
                                phase,
                                &state,
                            )
                            .await?;
                        }
                    }
                }
                Phase::Completed => {
                    // 最后一次撰写已推送 COMPLETED 快照；这里只补审计记录
                    let summary = format!("{} sections completed", state.completed_count());
                    let result = PhaseResult::new(Phase::Completed, 0, summary);
                    self.persist(session_id, result, phase, &state).await?;
                    if entry_phase == Phase::Completed {
                        self.emit(session_id, phase, &state);
                    }
                    let (prompt_tokens, completion_tokens, _) = self.writer.token_usage();
                    tracing::info!(
                        session_id = %session_id,
                        prompt_tokens,
                        completion_tokens,
                        "Pipeline completed"
                    );
                    return Ok(state);
                }
                Phase::Error => {
                    return Err(StateError::SessionClosed(SessionStatus::Error).into());
                }
            }
        }
    }

    /// 在途阶段与取消信号竞争
    async fn guard<T>(
        &self,
        cancel: &CancellationToken,
        phase: Phase,
        fut: impl Future<Output = T>,
    ) -> Result<T, ResearchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResearchError::Interrupted(format!("{phase} abandoned"))),
            out = fut => Ok(out),
        }
    }

    /// 选定下一个计划章节；首个章节沿用规划阶段的检索词
    fn activate_next(&self, state: ResearchState) -> Result<ResearchState, ResearchError> {
        let section = state
            .next_pending_section()
            .cloned()
            .ok_or(StateError::TargetReached(state.target_section_count))?;
        let queries = if state.pending_queries.is_empty() {
            section_queries(&state.topic, &section, self.query_budget)
        } else {
            state.pending_queries.clone()
        };
        tracing::info!(section = %section.title, ordinal = state.section_ordinal(), "Section activated");
        advance(state, StatePatch::Activated { section, queries })
    }

    /// 按恢复动作给出重新排队的检索词；预算耗尽时返回致命错误
    fn recover(
        &self,
        err: &PhaseError,
        attempts: &mut SectionAttempts,
        state: &ResearchState,
    ) -> Result<Vec<String>, ResearchError> {
        let section = state
            .active_section
            .as_ref()
            .ok_or(StateError::NoActiveSection)?;
        let action = self.recovery.handle(err, attempts);
        attempts.record(&action);
        tracing::warn!(section = %section.title, action = ?action, "Phase failed: {}", err);

        match action {
            RecoveryAction::WidenQueries => {
                Ok(widened_queries(&state.topic, section, self.query_budget))
            }
            RecoveryAction::RetrySection => {
                Ok(section_queries(&state.topic, section, self.query_budget))
            }
            RecoveryAction::Fail => Err(RecoveryEngine::into_fatal(err.clone(), &section.title)),
        }
    }

    fn fatal(&self, err: PhaseError, state: &ResearchState) -> ResearchError {
        let section = state
            .active_section
            .as_ref()
            .map(|s| s.title.as_str())
            .unwrap_or_default();
        RecoveryEngine::into_fatal(err, section)
    }

    /// 写检查点，成功后推送快照
    async fn checkpoint(
        &self,
        session_id: &str,
        result: PhaseResult,
        phase: Phase,
        state: &ResearchState,
    ) -> Result<(), ResearchError> {
        self.persist(session_id, result, phase, state).await?;
        self.emit(session_id, phase, state);
        Ok(())
    }

    async fn persist(
        &self,
        session_id: &str,
        result: PhaseResult,
        phase: Phase,
        state: &ResearchState,
    ) -> Result<(), ResearchError> {
        tracing::debug!(session_id = %session_id, key = %result.key, phase = %phase, "Checkpoint");
        let checkpoint = Checkpoint {
            phase,
            state: state.clone(),
        };
        self.store
            .apply_phase_result(session_id, result, &checkpoint)
            .await?;
        Ok(())
    }

    fn emit(&self, session_id: &str, phase: Phase, state: &ResearchState) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(PhaseSnapshot {
                session_id: session_id.to_string(),
                phase,
                state: state.clone(),
            });
        }
    }
}

fn advance(state: ResearchState, patch: StatePatch) -> Result<ResearchState, ResearchError> {
    tracing::debug!(patch = patch.kind(), "Applying state patch");
    Ok(state.apply(patch)?)
}
