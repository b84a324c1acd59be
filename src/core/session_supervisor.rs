//! 会话监管：取消令牌与心跳
//!
//! 每个运行中的会话持有一个 SessionSupervisor；心跳任务与流水线并行，
//! 周期性调用 `SessionStore::heartbeat`，会话结束（cancel）时退出。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::SessionStore;

#[derive(Debug)]
pub struct SessionSupervisor {
    session_id: String,
    /// 会话结束或外部关闭时触发
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    /// 以外部 token 为父，外部关闭会级联到本会话
    pub fn new(session_id: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            cancel_token: parent.child_token(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 启动心跳；心跳写入失败只记日志，不影响流水线
    pub fn spawn_heartbeat(
        &self,
        store: Arc<dyn SessionStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let token = self.cancel_token.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat(&session_id).await {
                            tracing::warn!(session_id = %session_id, "Heartbeat failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!(session_id = %session_id, "Heartbeat stopped");
        })
    }
}
