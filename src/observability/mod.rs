//! 可观测性：tracing 订阅器与会话 span

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志默认 info，可通过 RUST_LOG 覆盖；输出到 stderr，stdout 留给报告
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// 单个研究会话的 span，后台任务内的日志都带上 session_id
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("research_session", session_id = %session_id)
}
