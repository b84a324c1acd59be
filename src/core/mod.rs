//! 核心编排层：状态模型、错误与恢复、编排器、会话生命周期、监管与关闭

pub mod builder;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use builder::ResearchServiceBuilder;
pub use error::{PhaseError, RecoveryAction, ResearchError};
pub use lifecycle::{ResearchService, SessionHandle};
pub use orchestrator::Orchestrator;
pub use recovery::{RecoveryEngine, SectionAttempts};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
pub use state::{
    Checkpoint, Phase, PhaseResult, PhaseSnapshot, ResearchRequest, ResearchState, Section,
    SectionContent, Session, SessionStatus, Source, StateError, StatePatch, Subsection,
};
