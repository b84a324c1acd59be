//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发关闭 token；所有会话的 SessionSupervisor 都以它为父，
//! 在途阶段被放弃，会话保持 running，下次启动用 `deep-research resume` 续跑。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭 token（会话监管以它为父）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, interrupting running sessions...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, interrupting running sessions...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行 app 直到其结束或收到关闭信号
///
/// 关闭后最多再等 `grace`，让会话放弃在途阶段并落下检查点；超时返回 `None`，
/// 未落定的会话保持 running，下次用 `deep-research resume` 续跑。
pub async fn run_with_graceful_shutdown<F, T>(
    shutdown_manager: Arc<ShutdownManager>,
    grace: Duration,
    app: F,
) -> Option<T>
where
    F: Future<Output = T>,
{
    shutdown_manager.install_signal_handlers();
    tokio::pin!(app);

    tokio::select! {
        out = &mut app => {
            tracing::debug!("Application finished normally");
            return Some(out);
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!(grace_secs = grace.as_secs(), "Shutdown signal received, waiting for sessions to checkpoint");
        }
    }

    match tokio::time::timeout(grace, app).await {
        Ok(out) => Some(out),
        Err(_) => {
            tracing::warn!("Sessions did not stop within the grace period");
            None
        }
    }
}
