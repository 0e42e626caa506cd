//! 帧队列 Agent：收集提交到 frame-queue 广播点的帧，按加密级别交给发送 Agent

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use super::producer::{take_fitting, FrameProducer, FrameSpace};
use super::{Agent, AgentBase, Rendezvous};
use crate::quic::{Connection, EncryptionLevel, Frame};

pub struct FrameQueueAgent {
    base: AgentBase,
    requests: Rendezvous<FrameSpace, Vec<Frame>>,
}

impl FrameQueueAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: AgentBase::new("FrameQueueAgent"),
            requests: Rendezvous::new(),
        })
    }
}

impl Agent for FrameQueueAgent {
    fn base(&self) -> &AgentBase {
        &self.base
    }

    fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let mut ctx = self.base.init(&conn);
        let mut queued = conn.frame_queue.subscribe();
        let mut requests = self.requests.open();
        let span = ctx.span();

        tokio::spawn(
            async move {
                let mut queues: HashMap<EncryptionLevel, VecDeque<Frame>> = HashMap::new();
                loop {
                    // 先收完已提交的帧再应答，保证「先提交后请求」的帧一定能被取到
                    tokio::select! {
                        biased;
                        _ = ctx.closing() => break,
                        Some(q) = queued.recv() => {
                            tracing::debug!("Queued {} frame at {}", q.frame_type(), q.level);
                            queues.entry(q.level).or_default().push_back(q.frame);
                        }
                        Some(call) = requests.recv() => {
                            let space = call.args;
                            let frames = queues
                                .get_mut(&space.level)
                                .map(|q| take_fitting(q, space.available_space))
                                .unwrap_or_default();
                            call.reply(frames);
                        }
                        else => break,
                    }
                }
            }
            .instrument(span),
        );
    }

    fn frame_producer(self: Arc<Self>) -> Option<Arc<dyn FrameProducer>> {
        Some(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[async_trait]
impl FrameProducer for FrameQueueAgent {
    fn producer_name(&self) -> &'static str {
        self.base.name()
    }

    async fn request_frames(&self, space: FrameSpace) -> (Vec<Frame>, bool) {
        match self.requests.call(&self.base, space).await {
            Some(frames) => (frames, true),
            None => (Vec::new(), false),
        }
    }
}
