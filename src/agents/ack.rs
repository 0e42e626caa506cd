//! ACK Agent：记录每个包号空间收到的包号，按需生成 ACK 帧
//!
//! 某个空间的自动确认被关闭时，只有编排器通过 `send_from_queue` 显式要求才会发出 ACK。

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use super::producer::{FrameProducer, FrameSpace};
use super::{Agent, AgentBase, Rendezvous};
use crate::quic::{AckRange, Connection, Frame, PnSpace, QueuedFrame};

pub struct AckAgent {
    base: AgentBase,
    disabled: HashSet<PnSpace>,
    producer: Rendezvous<FrameSpace, Vec<Frame>>,
    explicit: Rendezvous<PnSpace, bool>,
}

/// 由收到的包号集合构造 ACK 帧（区间按 largest 降序）
pub fn ack_frame(received: &BTreeSet<u64>) -> Option<Frame> {
    let mut ranges: Vec<AckRange> = Vec::new();
    for &pn in received.iter().rev() {
        match ranges.last_mut() {
            Some(r) if pn.checked_add(1) == Some(r.smallest) => r.smallest = pn,
            _ => ranges.push(AckRange {
                smallest: pn,
                largest: pn,
            }),
        }
    }
    if ranges.is_empty() {
        return None;
    }
    Some(Frame::Ack {
        ack_delay: 0,
        ranges,
        ecn: None,
    })
}

#[derive(Default)]
struct AckState {
    received: HashMap<PnSpace, BTreeSet<u64>>,
    pending: HashSet<PnSpace>,
}

impl AckState {
    fn on_packet(&mut self, space: PnSpace, pn: u64, eliciting: bool) {
        self.received.entry(space).or_default().insert(pn);
        if eliciting {
            self.pending.insert(space);
        }
    }

    fn frame_for(&self, space: PnSpace) -> Option<Frame> {
        self.received.get(&space).and_then(ack_frame)
    }
}

impl AckAgent {
    pub fn new(disabled: &[PnSpace]) -> Arc<Self> {
        Arc::new(Self {
            base: AgentBase::new("AckAgent"),
            disabled: disabled.iter().copied().collect(),
            producer: Rendezvous::new(),
            explicit: Rendezvous::new(),
        })
    }

    /// 把该空间当前的 ACK 帧提交到 frame-queue；没有可确认的包时返回 false
    pub async fn send_from_queue(&self, space: PnSpace) -> bool {
        self.explicit
            .call(&self.base, space)
            .await
            .unwrap_or(false)
    }
}

impl Agent for AckAgent {
    fn base(&self) -> &AgentBase {
        &self.base
    }

    fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let mut ctx = self.base.init(&conn);
        let mut incoming = conn.incoming_packets.subscribe();
        let mut produce = self.producer.open();
        let mut explicit = self.explicit.open();
        let span = ctx.span();
        let disabled = self.disabled.clone();

        tokio::spawn(
            async move {
                let mut state = AckState::default();
                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.closing() => break,
                        Some(packet) = incoming.recv() => {
                            if let Some(pn) = packet.packet_number() {
                                state.on_packet(packet.pn_space(), pn, packet.should_be_acknowledged());
                            }
                        }
                        Some(call) = explicit.recv() => {
                            let space = call.args;
                            let sent = match state.frame_for(space) {
                                Some(frame) => {
                                    tracing::debug!("Queueing ACK for {:?}", space);
                                    state.pending.remove(&space);
                                    conn.frame_queue.submit(QueuedFrame::new(frame, space.encryption_level()));
                                    true
                                }
                                None => {
                                    tracing::info!("No packets to acknowledge in {:?}", space);
                                    false
                                }
                            };
                            call.reply(sent);
                        }
                        Some(call) = produce.recv() => {
                            let space = call.args.level.pn_space();
                            let mut frames = Vec::new();
                            if !disabled.contains(&space) && state.pending.contains(&space) {
                                if let Some(frame) = state.frame_for(space) {
                                    if frame.length() <= call.args.available_space {
                                        state.pending.remove(&space);
                                        frames.push(frame);
                                    }
                                }
                            }
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
impl FrameProducer for AckAgent {
    fn producer_name(&self) -> &'static str {
        self.base.name()
    }

    async fn request_frames(&self, space: FrameSpace) -> (Vec<Frame>, bool) {
        match self.producer.call(&self.base, space).await {
            Some(frames) => (frames, true),
            None => (Vec::new(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::connection::tests::test_connection;
    use crate::quic::{EncryptionLevel, FramedPacket, Header, LongHeader, Packet};

    fn handshake_packet(pn: u64) -> Packet {
        let mut p = FramedPacket::new(Header::Long(LongHeader {
            version: 1,
            destination_cid: vec![],
            source_cid: vec![],
            token: vec![],
            packet_number: pn,
        }));
        p.frames.push(Frame::Ping);
        Packet::Handshake(p)
    }

    #[test]
    fn test_ack_ranges_descending() {
        let received: BTreeSet<u64> = [0, 1, 2, 5, 7, 8].into_iter().collect();
        match ack_frame(&received) {
            Some(Frame::Ack { ranges, .. }) => assert_eq!(
                ranges,
                vec![
                    AckRange { smallest: 7, largest: 8 },
                    AckRange { smallest: 5, largest: 5 },
                    AckRange { smallest: 0, largest: 2 },
                ]
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ack_frame(&BTreeSet::new()), None);
    }

    #[tokio::test]
    async fn test_disabled_space_only_acks_on_request() {
        let (conn, _) = test_connection();
        let agent = AckAgent::new(&PnSpace::ALL);
        agent.clone().run(conn.clone());
        let mut queued = conn.frame_queue.subscribe();

        conn.receive(handshake_packet(3));
        let (frames, more) = agent
            .request_frames(FrameSpace {
                available_space: 100,
                level: EncryptionLevel::Handshake,
                packet_number: 0,
            })
            .await;
        assert!(more);
        assert!(frames.is_empty());

        assert!(agent.send_from_queue(PnSpace::Handshake).await);
        let q = queued.recv().await.unwrap();
        assert_eq!(q.level, EncryptionLevel::Handshake);
        assert_eq!(q.frame.frame_type(), crate::quic::FrameType::Ack);

        assert!(!agent.send_from_queue(PnSpace::AppData).await);
    }

    #[tokio::test]
    async fn test_enabled_space_produces_ack() {
        let (conn, _) = test_connection();
        let agent = AckAgent::new(&[]);
        agent.clone().run(conn.clone());
        conn.receive(handshake_packet(0));
        let space = FrameSpace {
            available_space: 100,
            level: EncryptionLevel::Handshake,
            packet_number: 0,
        };
        let (frames, _) = agent.request_frames(space).await;
        assert_eq!(frames.len(), 1);
        // 已确认，不再重复
        let (frames, _) = agent.request_frames(space).await;
        assert!(frames.is_empty());
    }
}
