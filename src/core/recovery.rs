//! 错误恢复引擎
//!
//! 根据 PhaseError 与当前章节已用的重试次数返回 RecoveryAction：
//! 写作失败重新检索同一章节，检索全失败扩大检索词一次，其余直接失败。

use crate::core::error::{PhaseError, RecoveryAction, ResearchError};

/// 每个章节独立计数，切换章节时重置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionAttempts {
    pub write_retries: u32,
    pub widenings: u32,
}

impl SectionAttempts {
    /// 记录一次已执行的恢复动作
    pub fn record(&mut self, action: &RecoveryAction) {
        match action {
            RecoveryAction::RetrySection => self.write_retries += 1,
            RecoveryAction::WidenQueries => self.widenings += 1,
            RecoveryAction::Fail => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_write_retries: u32,
    max_widenings: u32,
}

impl RecoveryEngine {
    pub fn new(max_write_retries: u32) -> Self {
        Self {
            max_write_retries,
            max_widenings: 1,
        }
    }

    pub fn max_write_retries(&self) -> u32 {
        self.max_write_retries
    }

    /// 规划错误永不重试；检索与写作按预算重试
    pub fn handle(&self, err: &PhaseError, attempts: &SectionAttempts) -> RecoveryAction {
        match err {
            PhaseError::Planning(_) => RecoveryAction::Fail,
            PhaseError::AllQueriesFailed { .. } if attempts.widenings < self.max_widenings => {
                RecoveryAction::WidenQueries
            }
            PhaseError::Write(_) if attempts.write_retries < self.max_write_retries => {
                RecoveryAction::RetrySection
            }
            _ => RecoveryAction::Fail,
        }
    }

    /// 预算耗尽后转换为会话级错误
    pub fn into_fatal(err: PhaseError, section: &str) -> ResearchError {
        match err {
            PhaseError::Planning(msg) => ResearchError::Planning(msg),
            PhaseError::AllQueriesFailed { .. } => ResearchError::SearchExhausted {
                section: section.to_string(),
                cause: err.to_string(),
            },
            PhaseError::Write(cause) => ResearchError::Write {
                section: section.to_string(),
                cause,
            },
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_failed() -> PhaseError {
        PhaseError::AllQueriesFailed {
            attempted: 3,
            last_error: "timeout".to_string(),
        }
    }

    #[test]
    fn test_recovery_planning_never_retried() {
        let engine = RecoveryEngine::default();
        let action = engine.handle(
            &PhaseError::Planning("bad count".to_string()),
            &SectionAttempts::default(),
        );
        assert_eq!(action, RecoveryAction::Fail);
    }

    #[test]
    fn test_recovery_widens_once() {
        let engine = RecoveryEngine::default();
        let mut attempts = SectionAttempts::default();

        let action = engine.handle(&all_failed(), &attempts);
        assert_eq!(action, RecoveryAction::WidenQueries);
        attempts.record(&action);

        assert_eq!(engine.handle(&all_failed(), &attempts), RecoveryAction::Fail);
    }

    #[test]
    fn test_recovery_write_retry_budget() {
        let engine = RecoveryEngine::new(2);
        let err = PhaseError::Write("unparseable".to_string());
        let mut attempts = SectionAttempts::default();

        for _ in 0..2 {
            let action = engine.handle(&err, &attempts);
            assert_eq!(action, RecoveryAction::RetrySection);
            attempts.record(&action);
        }
        assert_eq!(engine.handle(&err, &attempts), RecoveryAction::Fail);
    }

    #[test]
    fn test_recovery_zero_write_retries() {
        let engine = RecoveryEngine::new(0);
        let action = engine.handle(
            &PhaseError::Write("x".to_string()),
            &SectionAttempts::default(),
        );
        assert_eq!(action, RecoveryAction::Fail);
    }

    #[test]
    fn test_into_fatal_messages() {
        let err = RecoveryEngine::into_fatal(all_failed(), "Vectors");
        let msg = err.to_string();
        assert!(msg.starts_with("Search exhausted for section 'Vectors'"));
        assert!(msg.contains("timeout"));
        assert!(err.is_terminal());

        let err = RecoveryEngine::into_fatal(PhaseError::Write("bad".to_string()), "Vectors");
        assert!(matches!(err, ResearchError::Write { .. }));
    }
}
