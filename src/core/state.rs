//! 会话与研究状态
//!
//! `ResearchState` 是不可变值：每次变化都是一个显式的 `StatePatch`，由 `apply` 产出新值，
//! 违反不变量（已完成数超过目标、两个章节同时在写、未规划即激活）的补丁会被拒绝。
//! `Session` 是持久化文档，包含状态、阶段审计表与心跳。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 当前时间（毫秒时间戳）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Planning,
    Researching,
    Writing,
    Completed,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "PLANNING",
            Phase::Researching => "RESEARCHING",
            Phase::Writing => "WRITING",
            Phase::Completed => "COMPLETED",
            Phase::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNING" => Ok(Phase::Planning),
            "RESEARCHING" => Ok(Phase::Researching),
            "WRITING" => Ok(Phase::Writing),
            "COMPLETED" => Ok(Phase::Completed),
            "ERROR" => Ok(Phase::Error),
            other => Err(StateError::UnknownPhase(other.to_string())),
        }
    }
}

/// 会话状态（running / completed / error）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            other => Err(StateError::UnknownStatus(other.to_string())),
        }
    }
}

/// 状态转换或会话更新被拒绝的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Plan already set")]
    PlanAlreadySet,

    #[error("Plan has {actual} sections, expected {expected}")]
    PlanSizeMismatch { expected: usize, actual: usize },

    #[error("Section '{0}' has no subsections")]
    EmptySubsections(String),

    #[error("No plan yet")]
    NoPlan,

    #[error("Section '{0}' is still in flight")]
    SectionInFlight(String),

    #[error("No active section")]
    NoActiveSection,

    #[error("Expected section '{expected}', got '{actual}'")]
    UnexpectedSection { expected: String, actual: String },

    #[error("Target of {0} sections already reached")]
    TargetReached(usize),

    #[error("Section '{0}' has no content")]
    MissingContent(String),

    #[error("Only {completed} of {target} sections completed")]
    Incomplete { completed: usize, target: usize },

    #[error("Session is already {0}")]
    SessionClosed(SessionStatus),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

/// 引用来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Source {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsection {
    pub description: String,
    pub body: String,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionContent {
    pub overview: String,
    /// 子章节标题 → 内容
    pub subsections: BTreeMap<String, Subsection>,
}

/// 报告章节；`content` 为空表示尚未撰写
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub description: String,
    pub subsection_titles: Vec<String>,
    #[serde(default)]
    pub content: Option<SectionContent>,
}

impl Section {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        subsection_titles: Vec<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            subsection_titles,
            content: None,
        }
    }

    pub fn with_content(mut self, content: SectionContent) -> Self {
        self.content = Some(content);
        self
    }
}

/// 对 ResearchState 的一次显式修改
#[derive(Debug, Clone, PartialEq)]
pub enum StatePatch {
    /// 规划完成：设置章节计划与首批检索词
    Planned {
        sections: Vec<Section>,
        queries: Vec<String>,
    },
    /// 选定下一个待写章节并装入检索词
    Activated {
        section: Section,
        queries: Vec<String>,
    },
    /// 同一章节重新排队检索（扩大检索词或写作失败后重做），已有证据作废
    Requeued { queries: Vec<String> },
    /// 检索完成：写入证据，消费检索词
    Researched { evidence: String },
    /// 章节写完：追加到已完成列表并清空在途状态
    Written { section: Section },
}

impl StatePatch {
    pub fn kind(&self) -> &'static str {
        match self {
            StatePatch::Planned { .. } => "planned",
            StatePatch::Activated { .. } => "activated",
            StatePatch::Requeued { .. } => "requeued",
            StatePatch::Researched { .. } => "researched",
            StatePatch::Written { .. } => "written",
        }
    }
}

/// 研究流水线的全部工作状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchState {
    pub topic: String,
    pub target_section_count: usize,
    #[serde(default)]
    pub planned_sections: Vec<Section>,
    #[serde(default)]
    pub active_section: Option<Section>,
    #[serde(default)]
    pub search_iterations: u32,
    #[serde(default)]
    pub pending_queries: Vec<String>,
    #[serde(default)]
    pub aggregated_evidence: String,
    #[serde(default)]
    pub completed_sections: Vec<Section>,
}

impl ResearchState {
    pub fn new(topic: impl Into<String>, target_section_count: usize) -> Self {
        Self {
            topic: topic.into(),
            target_section_count,
            planned_sections: Vec::new(),
            active_section: None,
            search_iterations: 0,
            pending_queries: Vec::new(),
            aggregated_evidence: String::new(),
            completed_sections: Vec::new(),
        }
    }

    pub fn has_plan(&self) -> bool {
        !self.planned_sections.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_sections.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_sections.len() == self.target_section_count
    }

    /// 下一个尚未完成的计划章节（章节严格按计划顺序撰写）
    pub fn next_pending_section(&self) -> Option<&Section> {
        if self.is_complete() {
            return None;
        }
        self.planned_sections.get(self.completed_sections.len())
    }

    /// 当前章节的 1 起始序号（用作审计键）
    pub fn section_ordinal(&self) -> usize {
        self.completed_sections.len() + 1
    }

    /// 仅依据持久化状态推导续跑入口阶段
    pub fn resume_phase(&self) -> Phase {
        if !self.has_plan() {
            return Phase::Planning;
        }
        if self.is_complete() {
            return Phase::Completed;
        }
        match &self.active_section {
            None => Phase::Researching,
            Some(_) if !self.pending_queries.is_empty() => Phase::Researching,
            Some(_) => Phase::Writing,
        }
    }

    /// 应用补丁，返回新状态；违反不变量时返回 StateError 且原状态不受影响
    pub fn apply(self, patch: StatePatch) -> Result<Self, StateError> {
        let mut next = self;
        match patch {
            StatePatch::Planned { sections, queries } => {
                if next.has_plan() {
                    return Err(StateError::PlanAlreadySet);
                }
                if sections.len() != next.target_section_count {
                    return Err(StateError::PlanSizeMismatch {
                        expected: next.target_section_count,
                        actual: sections.len(),
                    });
                }
                if let Some(empty) = sections.iter().find(|s| s.subsection_titles.is_empty()) {
                    return Err(StateError::EmptySubsections(empty.title.clone()));
                }
                next.planned_sections = sections;
                next.pending_queries = queries;
            }
            StatePatch::Activated { section, queries } => {
                if !next.has_plan() {
                    return Err(StateError::NoPlan);
                }
                if let Some(active) = &next.active_section {
                    return Err(StateError::SectionInFlight(active.title.clone()));
                }
                let expected = next
                    .next_pending_section()
                    .ok_or(StateError::TargetReached(next.target_section_count))?;
                if expected.title != section.title {
                    return Err(StateError::UnexpectedSection {
                        expected: expected.title.clone(),
                        actual: section.title,
                    });
                }
                next.active_section = Some(section);
                next.pending_queries = queries;
                next.aggregated_evidence.clear();
                next.search_iterations = 0;
            }
            StatePatch::Requeued { queries } => {
                if next.active_section.is_none() {
                    return Err(StateError::NoActiveSection);
                }
                next.pending_queries = queries;
                next.aggregated_evidence.clear();
            }
            StatePatch::Researched { evidence } => {
                if next.active_section.is_none() {
                    return Err(StateError::NoActiveSection);
                }
                next.aggregated_evidence = evidence;
                next.search_iterations += 1;
                next.pending_queries.clear();
            }
            StatePatch::Written { section } => {
                let active = next.active_section.as_ref().ok_or(StateError::NoActiveSection)?;
                if active.title != section.title {
                    return Err(StateError::UnexpectedSection {
                        expected: active.title.clone(),
                        actual: section.title,
                    });
                }
                if section.content.is_none() {
                    return Err(StateError::MissingContent(section.title));
                }
                if next.completed_sections.len() >= next.target_section_count {
                    return Err(StateError::TargetReached(next.target_section_count));
                }
                next.completed_sections.push(section);
                next.active_section = None;
                next.pending_queries.clear();
                next.aggregated_evidence.clear();
                next.search_iterations = 0;
            }
        }
        Ok(next)
    }
}

/// 提交研究请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub topic: String,
    pub target_section_count: usize,
    pub owner_id: String,
}

impl ResearchRequest {
    pub fn new(
        topic: impl Into<String>,
        target_section_count: usize,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            target_section_count,
            owner_id: owner_id.into(),
        }
    }
}

/// 阶段审计记录；同 key 重复写入覆盖（幂等）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub key: String,
    pub timestamp: i64,
    pub summary: String,
}

impl PhaseResult {
    pub fn new(phase: Phase, ordinal: usize, summary: impl Into<String>) -> Self {
        Self {
            phase,
            key: audit_key(phase, ordinal),
            timestamp: now_millis(),
            summary: summary.into(),
        }
    }
}

/// 审计键：planning、researching#n、writing#n、completed
pub fn audit_key(phase: Phase, ordinal: usize) -> String {
    match phase {
        Phase::Planning => "planning".to_string(),
        Phase::Researching => format!("researching#{ordinal}"),
        Phase::Writing => format!("writing#{ordinal}"),
        Phase::Completed => "completed".to_string(),
        Phase::Error => "error".to_string(),
    }
}

/// 检查点：阶段转换后的入口阶段与完整状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: Phase,
    pub state: ResearchState,
}

/// 每次转换后推送给调用方的快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSnapshot {
    pub session_id: String,
    pub phase: Phase,
    pub state: ResearchState,
}

/// 持久化的会话文档
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub query: String,
    pub target_section_count: usize,
    pub status: SessionStatus,
    pub current_phase: Phase,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_heartbeat: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    pub state: ResearchState,
    #[serde(default)]
    pub phase_results: BTreeMap<String, PhaseResult>,
}

impl Session {
    pub fn new(request: &ResearchRequest) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: request.owner_id.clone(),
            query: request.topic.clone(),
            target_section_count: request.target_section_count,
            status: SessionStatus::Running,
            current_phase: Phase::Planning,
            created_at: now,
            updated_at: now,
            last_heartbeat: None,
            error: None,
            state: ResearchState::new(request.topic.clone(), request.target_section_count),
            phase_results: BTreeMap::new(),
        }
    }

    fn ensure_running(&self) -> Result<(), StateError> {
        if self.status != SessionStatus::Running {
            return Err(StateError::SessionClosed(self.status));
        }
        Ok(())
    }

    /// 写入审计记录并用检查点替换状态
    pub fn record_phase(
        &mut self,
        result: PhaseResult,
        checkpoint: &Checkpoint,
    ) -> Result<(), StateError> {
        self.ensure_running()?;
        self.phase_results.insert(result.key.clone(), result);
        self.state = checkpoint.state.clone();
        self.current_phase = checkpoint.phase;
        self.updated_at = now_millis();
        Ok(())
    }

    /// 仅当已完成章节数等于目标时才能标记完成
    pub fn mark_completed(&mut self, final_state: ResearchState) -> Result<(), StateError> {
        self.ensure_running()?;
        if !final_state.is_complete() {
            return Err(StateError::Incomplete {
                completed: final_state.completed_count(),
                target: final_state.target_section_count,
            });
        }
        self.state = final_state;
        self.status = SessionStatus::Completed;
        self.current_phase = Phase::Completed;
        self.updated_at = now_millis();
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), StateError> {
        if self.status == SessionStatus::Completed {
            return Err(StateError::SessionClosed(self.status));
        }
        self.status = SessionStatus::Error;
        self.current_phase = Phase::Error;
        self.error = Some(message.into());
        self.updated_at = now_millis();
        Ok(())
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Some(now_millis());
    }
}
