//! 进程关闭信号
//!
//! 学习器发出 STOP、收到 Ctrl+C / SIGTERM 或遇到实例致命错误时都走同一条关闭路径：
//! 取消 token，记录第一个关闭原因，行服务器据此执行持久化后退出。

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 学习器发送了 STOP
    LearnerStop,
    /// 实例致命错误（未知帧类型、引擎故障等）
    FatalError(String),
}

impl ShutdownReason {
    /// 是否以失败状态退出进程
    pub fn is_failure(&self) -> bool {
        matches!(self, ShutdownReason::FatalError(_))
    }
}

/// 关闭信号：一个取消 token 加上只写一次的关闭原因
pub struct ShutdownManager {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；原因只记第一次的，之后的调用只是重复取消
    pub fn shutdown(&self, reason: ShutdownReason) {
        let recorded = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if recorded {
            tracing::info!("Shutdown requested: {:?}", reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    /// 观察关闭原因；触发前为 None
    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.reason.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM 都转成一次关闭请求
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Some(reason) = next_signal().await else {
                return;
            };
            tracing::info!("Received {:?}, persisting oracle table before exit", reason);
            manager.shutdown(reason);
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn next_signal() -> Option<ShutdownReason> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            return tokio::select! {
                r = tokio::signal::ctrl_c() => r.ok().map(|_| ShutdownReason::UserInitiated),
                _ = sigterm.recv() => Some(ShutdownReason::Signal),
            };
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some(ShutdownReason::UserInitiated),
        Err(e) => {
            tracing::warn!("Cannot listen for Ctrl+C: {}", e);
            None
        }
    }
}
