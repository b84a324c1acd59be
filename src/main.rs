//! Deep Research 命令行入口
//!
//! ```bash
//! deep-research run "Linear Algebra" 6 --owner alice
//! deep-research resume <session-id>
//! deep-research resume-all
//! ```
//! 进度输出到 stderr，最终报告（Markdown）输出到 stdout。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deep_research::config::{load_config, AppConfig};
use deep_research::core::{
    run_with_graceful_shutdown, PhaseSnapshot, ResearchServiceBuilder, SessionHandle,
    SessionStatus, ShutdownManager,
};
use deep_research::{observability, report, ResearchRequest};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "deep-research")]
#[command(version, about = "Plan / search / write multi-section research reports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true, env = "RESEARCH_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new research session
    Run {
        /// Report topic
        topic: String,

        /// Number of sections (default: [research].default_section_count)
        sections: Option<usize>,

        /// Requesting owner id (default: [app].default_owner_id)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Continue a running session from its last checkpoint
    Resume {
        session_id: String,
    },

    /// Continue every session left running by a previous process
    ResumeAll,
}

fn print_progress(snapshot: &PhaseSnapshot) {
    let state = &snapshot.state;
    let section = state
        .active_section
        .as_ref()
        .map(|s| s.title.as_str())
        .unwrap_or("-");
    eprintln!(
        "[{}] {}/{} sections done, active: {}",
        snapshot.phase,
        state.completed_count(),
        state.target_section_count,
        section
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let cfg: AppConfig = load_config(cli.config).context("Failed to load config")?;
    let default_sections = cfg.research.default_section_count;
    let default_owner = cfg.app.default_owner_id.clone();
    let grace = Duration::from_secs(cfg.app.shutdown_grace_secs);

    let shutdown = Arc::new(ShutdownManager::new());
    let mut reasons = shutdown.subscribe();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PhaseSnapshot>();
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = event_rx.recv().await {
            print_progress(&snapshot);
        }
    });

    let service = ResearchServiceBuilder::new(cfg)
        .with_events(event_tx)
        .with_shutdown(shutdown.token())
        .build()
        .await;

    let handles: Vec<SessionHandle> = match cli.command {
        Command::Run {
            topic,
            sections,
            owner,
        } => {
            let request = ResearchRequest::new(
                topic,
                sections.unwrap_or(default_sections),
                owner.unwrap_or(default_owner),
            );
            let handle = service
                .submit(request)
                .await
                .context("Failed to start research session")?;
            eprintln!("session {}", handle.session_id);
            vec![handle]
        }
        Command::Resume { session_id } => vec![service
            .resume(&session_id)
            .await
            .with_context(|| format!("Failed to resume session {session_id}"))?],
        Command::ResumeAll => service
            .resume_incomplete()
            .await
            .context("Failed to list incomplete sessions")?,
    };

    let session_ids: Vec<String> = handles.iter().map(|h| h.session_id.clone()).collect();
    let finished = run_with_graceful_shutdown(shutdown, grace, async move {
        for handle in handles {
            handle.wait().await;
        }
    })
    .await;
    printer.abort();
    if let Ok(reason) = reasons.try_recv() {
        tracing::info!(reason = ?reason, "Stopped before sessions finished");
    }
    if finished.is_none() {
        tracing::warn!("Some sessions were still running at exit; their last checkpoint is kept");
    }

    let mut failed = false;
    for id in &session_ids {
        let session = service
            .store()
            .get_session(id)
            .await
            .context("Failed to read session")?
            .with_context(|| format!("Session {id} disappeared from the store"))?;
        match session.status {
            SessionStatus::Completed => println!("{}", report::render_markdown(&session.state)),
            SessionStatus::Error => {
                failed = true;
                eprintln!(
                    "session {id} failed: {}",
                    session.error.as_deref().unwrap_or("unknown error")
                );
            }
            SessionStatus::Running => {
                eprintln!("session {id} interrupted; continue with: deep-research resume {id}")
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
