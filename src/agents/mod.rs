//! Agent 框架
//!
//! 每个 Agent 负责连接行为的一小部分，运行在自己的 tokio 任务里，只通过广播点与
//! 请求/应答通道和其他部分交流。生命周期对所有 Agent 一致：
//!
//! - `run(conn)`：建立订阅并启动工作循环（每次启动 / 重启各调用一次）
//! - `stop()`：幂等、不阻塞，循环退出后不再重启
//! - `restart()`：以「将被重启」模式退出
//! - `join()`：等待工作循环确认退出
//!
//! 订阅在 `run` 返回前完成，因此 `run` 之后发布的任何消息都不会丢失。

pub mod ack;
pub mod closing;
pub mod crypto;
pub mod flow_control;
pub mod frame_queue;
pub mod http;
pub mod producer;
pub mod registry;
pub mod rendezvous;
pub mod sending;

use std::any::Any;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::quic::{lock, Connection};

pub use ack::AckAgent;
pub use closing::{ClosingAgent, ClosingSettings};
pub use crypto::{CryptoAgent, CryptoSettings};
pub use flow_control::{FlowControlAgent, FlowControlLimits, FlowControlSettings, FlowControlSnapshot};
pub use frame_queue::FrameQueueAgent;
pub use http::{HttpAgent, HttpVersion};
pub use producer::{FrameProducer, FrameSpace};
pub use registry::ConnectionAgents;
pub use rendezvous::{Call, Rendezvous};
pub use sending::{SendingAgent, SendingSettings};

/// 关闭方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    Stop,
    Restart,
}

type CloseSignal = watch::Receiver<Option<CloseMode>>;

/// 等待关闭请求；发送端被替换或销毁时视为 Stop
pub(crate) async fn wait_close(rx: &mut CloseSignal) -> CloseMode {
    loop {
        if let Some(mode) = *rx.borrow_and_update() {
            return mode;
        }
        if rx.changed().await.is_err() {
            return CloseMode::Stop;
        }
    }
}

struct RunState {
    close: watch::Sender<Option<CloseMode>>,
    closed: CancellationToken,
}

/// 所有 Agent 共用的生命周期状态
pub struct AgentBase {
    name: &'static str,
    run: Mutex<Option<RunState>>,
}

impl AgentBase {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            run: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 每次启动调用一次：换上新的关闭信号，返回交给工作循环的上下文
    pub fn init(&self, conn: &Connection) -> AgentContext {
        let (close, close_rx) = watch::channel(None);
        let closed = CancellationToken::new();
        let done = closed.clone().drop_guard();
        *lock(&self.run) = Some(RunState { close, closed });
        let span = tracing::info_span!("agent", name = self.name, odcid = %conn.odcid_hex());
        span.in_scope(|| tracing::info!("Agent started"));
        AgentContext {
            close: close_rx,
            span,
            _done: done,
        }
    }

    pub fn stop(&self) {
        self.signal(CloseMode::Stop);
    }

    pub fn restart(&self) {
        self.signal(CloseMode::Restart);
    }

    /// 只有第一次关闭请求生效
    fn signal(&self, mode: CloseMode) {
        if let Some(state) = lock(&self.run).as_ref() {
            state.close.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(mode);
                    true
                } else {
                    false
                }
            });
        }
    }

    /// 等待当前这一轮工作循环退出；从未启动时立即返回
    pub async fn join(&self) {
        let closed = lock(&self.run).as_ref().map(|s| s.closed.clone());
        if let Some(closed) = closed {
            closed.cancelled().await;
        }
    }

    /// 订阅当前这一轮的关闭信号（请求/应答的发起方用它在 Agent 停止时解除阻塞）
    pub(crate) fn close_signal(&self) -> Option<CloseSignal> {
        lock(&self.run).as_ref().map(|s| s.close.subscribe())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .map(|s| !s.closed.is_cancelled())
            .unwrap_or(false)
    }
}

/// 工作循环持有的上下文；被丢弃时标记本轮循环已退出
pub struct AgentContext {
    close: CloseSignal,
    span: tracing::Span,
    _done: DropGuard,
}

impl AgentContext {
    /// 等待关闭请求，可安全用于 `select!`
    pub async fn closing(&mut self) -> CloseMode {
        wait_close(&mut self.close).await
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }
}

impl Drop for AgentContext {
    fn drop(&mut self) {
        self.span.in_scope(|| tracing::info!("Agent terminated"));
    }
}

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn base(&self) -> &AgentBase;

    fn name(&self) -> &'static str {
        self.base().name()
    }

    /// 建立订阅并在后台启动工作循环
    fn run(self: Arc<Self>, conn: Arc<Connection>);

    fn stop(&self) {
        self.base().stop();
    }

    fn restart(&self) {
        self.base().restart();
    }

    async fn join(&self) {
        self.base().join().await;
    }

    /// 能向发送 Agent 提供帧的 Agent 返回自身
    fn frame_producer(self: Arc<Self>) -> Option<Arc<dyn FrameProducer>> {
        None
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::connection::tests::test_connection;

    struct Idle {
        base: AgentBase,
    }

    impl Agent for Idle {
        fn base(&self) -> &AgentBase {
            &self.base
        }

        fn run(self: Arc<Self>, conn: Arc<Connection>) {
            let mut ctx = self.base.init(&conn);
            tokio::spawn(async move {
                let _ = ctx.closing().await;
            });
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (conn, _) = test_connection();
        let agent = Arc::new(Idle {
            base: AgentBase::new("Idle"),
        });
        agent.clone().run(conn);
        assert!(agent.base().is_running());
        agent.stop();
        agent.stop();
        agent.restart();
        agent.join().await;
        assert!(!agent.base().is_running());
        // 已退出后再次 join 立即返回
        agent.join().await;
    }

    #[tokio::test]
    async fn test_join_before_run_returns() {
        let agent = Idle {
            base: AgentBase::new("Idle"),
        };
        agent.stop();
        agent.join().await;
    }

    #[tokio::test]
    async fn test_first_close_request_wins() {
        let (conn, _) = test_connection();
        let base = AgentBase::new("Idle");
        let mut ctx = base.init(&conn);
        base.restart();
        base.stop();
        assert_eq!(ctx.closing().await, CloseMode::Restart);
    }
}
