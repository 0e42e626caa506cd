//! 发送 Agent：决定何时以哪个加密级别打包，并向各帧生产者取帧
//!
//! 维护每个级别写方向的可用性，把虚拟级别解析为具体级别：
//! - Best：1-RTT、Handshake、Initial 中第一个可用的，都不可用时为 Initial
//! - BestAppData：1-RTT、0-RTT 中第一个可用的，都不可用时为 1-RTT
//!
//! 填包时按注册顺序询问每个生产者（请求的级别以及解析到该级别的虚拟级别），
//! 直到预算用完；报告不再生产的生产者在本轮运行中被移除。
//! 没有帧的包被丢弃，并回滚其包号。

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::Instrument;

use super::producer::{FrameProducer, FrameSpace};
use super::{Agent, AgentBase};
use crate::quic::{
    Connection, DirectionalEncryptionLevel, EncryptionLevel, Frame, Packet, PacketToSend,
    MIN_INITIAL_LENGTH, MIN_INITIAL_LENGTH_V6,
};

const BEST: [EncryptionLevel; 3] = [
    EncryptionLevel::OneRtt,
    EncryptionLevel::Handshake,
    EncryptionLevel::Initial,
];

const BEST_APP_DATA: [EncryptionLevel; 2] = [EncryptionLevel::OneRtt, EncryptionLevel::ZeroRtt];

const CONCRETE_LEVELS: [EncryptionLevel; 4] = [
    EncryptionLevel::Initial,
    EncryptionLevel::ZeroRtt,
    EncryptionLevel::Handshake,
    EncryptionLevel::OneRtt,
];

#[derive(Debug, Clone, Copy)]
pub struct SendingSettings {
    pub mtu: usize,
    pub keep_dropped_encryption_levels: bool,
    pub dont_coalesce_zero_rtt: bool,
}

impl Default for SendingSettings {
    fn default() -> Self {
        Self {
            mtu: MIN_INITIAL_LENGTH,
            keep_dropped_encryption_levels: false,
            dont_coalesce_zero_rtt: false,
        }
    }
}

pub struct SendingAgent {
    base: AgentBase,
    settings: SendingSettings,
    producers: Vec<Arc<dyn FrameProducer>>,
}

impl SendingAgent {
    pub fn new(settings: SendingSettings, producers: Vec<Arc<dyn FrameProducer>>) -> Arc<Self> {
        Arc::new(Self {
            base: AgentBase::new("SendingAgent"),
            settings,
            producers,
        })
    }
}

struct SendingLoop {
    conn: Arc<Connection>,
    settings: SendingSettings,
    available: HashMap<EncryptionLevel, bool>,
    best: HashMap<EncryptionLevel, EncryptionLevel>,
    initial_sent: bool,
    producers: Vec<Arc<dyn FrameProducer>>,
}

impl SendingLoop {
    fn new(
        conn: Arc<Connection>,
        settings: SendingSettings,
        producers: Vec<Arc<dyn FrameProducer>>,
    ) -> Self {
        let mut available = HashMap::from([(EncryptionLevel::None, true)]);
        for level in CONCRETE_LEVELS {
            available.insert(level, conn.crypto_state(level).is_some());
        }
        let mut this = Self {
            conn,
            settings,
            available,
            best: HashMap::new(),
            initial_sent: false,
            producers,
        };
        this.recompute_best();
        this
    }

    fn is_available(&self, level: EncryptionLevel) -> bool {
        self.available.get(&level).copied().unwrap_or(false)
    }

    fn choose(&self, alias: EncryptionLevel) -> EncryptionLevel {
        let (order, fallback): (&[EncryptionLevel], _) = match alias {
            EncryptionLevel::Best => (&BEST, EncryptionLevel::Initial),
            EncryptionLevel::BestAppData => (&BEST_APP_DATA, EncryptionLevel::OneRtt),
            other => return other,
        };
        order
            .iter()
            .copied()
            .find(|l| self.is_available(*l))
            .unwrap_or(fallback)
    }

    fn recompute_best(&mut self) {
        for alias in [EncryptionLevel::Best, EncryptionLevel::BestAppData] {
            let chosen = self.choose(alias);
            if self.best.insert(alias, chosen) != Some(chosen) {
                tracing::debug!("Chose {} as new encryption level for {}", chosen, alias);
            }
        }
    }

    fn on_level(&mut self, change: DirectionalEncryptionLevel) {
        if change.read {
            return;
        }
        if change.available {
            self.available.insert(change.level, true);
        } else if !self.settings.keep_dropped_encryption_levels {
            self.available.insert(change.level, false);
        }
        self.recompute_best();
    }

    /// 请求级别加上当前解析到它的虚拟级别
    fn levels_for(&self, level: EncryptionLevel) -> Vec<EncryptionLevel> {
        let mut levels = vec![level];
        for alias in [EncryptionLevel::Best, EncryptionLevel::BestAppData] {
            if self.best.get(&alias) == Some(&level) {
                levels.push(alias);
            }
        }
        levels
    }

    async fn prepare(&mut self, requested: EncryptionLevel) {
        let level = if requested.is_virtual() {
            let chosen = self.choose(requested);
            self.best.insert(requested, chosen);
            chosen
        } else {
            requested
        };
        if !self.is_available(level) {
            tracing::debug!("Encryption level {} is not available, not preparing", level);
            return;
        }
        if level == EncryptionLevel::ZeroRtt && !self.initial_sent {
            tracing::debug!("Holding back 0-RTT until the first Initial has been sent");
            return;
        }
        let Some(shell) = self.conn.new_packet(level) else {
            return;
        };
        if let Some(packet) = self.fill(shell, level).await {
            self.send(packet, level).await;
        }
    }

    /// 向各生产者取帧填满包；没有帧时回滚包号并返回 None
    async fn fill(&mut self, mut packet: Packet, level: EncryptionLevel) -> Option<Packet> {
        let packet_number = packet.packet_number()?;
        let mut left = self
            .settings
            .mtu
            .saturating_sub(packet.header_length())
            .saturating_sub(self.conn.crypto_overhead(level));
        let levels = self.levels_for(level);
        let mut frames: Vec<Frame> = Vec::new();

        let mut i = 0;
        'producers: while i < self.producers.len() {
            let producer = self.producers[i].clone();
            for &l in &levels {
                if left == 0 {
                    break 'producers;
                }
                let space = FrameSpace {
                    available_space: left,
                    level: l,
                    packet_number,
                };
                let (got, more) = producer.request_frames(space).await;
                if !more {
                    tracing::debug!("Producer {} is done, removing it", producer.producer_name());
                    self.producers.remove(i);
                    continue 'producers;
                }
                for frame in got {
                    left = left.saturating_sub(frame.length());
                    frames.push(frame);
                }
            }
            i += 1;
        }

        if frames.is_empty() {
            tracing::debug!(
                "Preparing a packet for encryption level {} resulted in an empty packet, discarding",
                level
            );
            self.conn.rollback_packet_number(level.pn_space());
            return None;
        }
        packet.framed_mut()?.frames.extend(frames);
        Some(packet)
    }

    fn min_initial_length(&self) -> usize {
        if self.conn.use_ipv6() {
            MIN_INITIAL_LENGTH_V6
        } else {
            MIN_INITIAL_LENGTH
        }
    }

    fn pad_initial(&self, packet: &mut Packet, extra: usize) {
        let target = self
            .min_initial_length()
            .saturating_sub(self.conn.crypto_overhead(EncryptionLevel::Initial))
            .saturating_sub(extra);
        if let Some(framed) = packet.framed_mut() {
            framed.strip_padding();
            framed.pad_to(target);
        }
    }

    fn can_coalesce(&self) -> bool {
        !self.settings.dont_coalesce_zero_rtt
            && !self.initial_sent
            && self.best.get(&EncryptionLevel::BestAppData) == Some(&EncryptionLevel::ZeroRtt)
            && self.is_available(EncryptionLevel::ZeroRtt)
    }

    /// 把首个 Initial 与一个 0-RTT 包合并进同一个传输单元；没有 0-RTT 帧时原样交回
    async fn coalesce_zero_rtt(&mut self, initial: Packet) -> Result<(), Packet> {
        let Some(shell) = self.conn.new_packet(EncryptionLevel::ZeroRtt) else {
            return Err(initial);
        };
        let Some(zero) = self.fill(shell, EncryptionLevel::ZeroRtt).await else {
            return Err(initial);
        };
        let zero_len = self.conn.encoded_len(&zero, EncryptionLevel::ZeroRtt);
        let mut initial = initial;
        self.pad_initial(&mut initial, zero_len);
        if let Err(e) = self.conn.send_coalesced(vec![initial, zero]) {
            tracing::warn!("Failed to send coalesced Initial and 0-RTT: {}", e);
        }
        Ok(())
    }

    async fn send(&mut self, packet: Packet, level: EncryptionLevel) {
        let mut packet = packet;
        if level == EncryptionLevel::Initial {
            if self.can_coalesce() {
                match self.coalesce_zero_rtt(packet).await {
                    Ok(()) => {
                        self.initial_sent = true;
                        return;
                    }
                    Err(p) => packet = p,
                }
            }
            self.pad_initial(&mut packet, 0);
            self.initial_sent = true;
        }
        if let Err(e) = self.conn.send_packet(packet) {
            tracing::warn!("Failed to send packet at {}: {}", level, e);
        }
    }
}

impl Agent for SendingAgent {
    fn base(&self) -> &AgentBase {
        &self.base
    }

    fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let mut ctx = self.base.init(&conn);
        let mut levels = conn.encryption_levels.subscribe();
        let mut prepare = conn.prepare_packet.subscribe();
        let mut to_send = conn.send_packet.subscribe();
        let span = ctx.span();
        let mut sender = SendingLoop::new(conn, self.settings, self.producers.clone());

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.closing() => break,
                        Some(change) = levels.recv() => sender.on_level(change),
                        Some(level) = prepare.recv() => sender.prepare(level).await,
                        Some(PacketToSend { packet, level }) = to_send.recv() => {
                            sender.send(packet, level).await
                        }
                        else => break,
                    }
                }
            }
            .instrument(span),
        );
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::FrameQueueAgent;
    use crate::engine::Transport;
    use crate::quic::connection::tests::{test_connection, RecordingTransport};
    use crate::quic::{FrameType, PnSpace, QueuedFrame, AEAD_OVERHEAD};

    fn start(conn: &Arc<Connection>) -> (Arc<FrameQueueAgent>, Arc<SendingAgent>) {
        let queue = FrameQueueAgent::new();
        queue.clone().run(conn.clone());
        let producers: Vec<Arc<dyn FrameProducer>> = vec![queue.clone()];
        let sending = SendingAgent::new(SendingSettings::default(), producers);
        sending.clone().run(conn.clone());
        (queue, sending)
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    fn sent(transport: &RecordingTransport) -> Vec<Vec<Packet>> {
        transport.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_empty_packet_is_discarded_without_consuming_pn() {
        let (conn, transport) = test_connection();
        let _agents = start(&conn);
        conn.prepare_packet.submit(EncryptionLevel::Initial);
        settle().await;
        assert!(sent(&transport).is_empty());
        assert_eq!(conn.next_packet_number(PnSpace::Initial), 0);
    }

    #[tokio::test]
    async fn test_initial_is_padded_to_minimum() {
        let (conn, transport) = test_connection();
        let _agents = start(&conn);
        conn.frame_queue
            .submit(QueuedFrame::new(Frame::Ping, EncryptionLevel::Initial));
        conn.prepare_packet.submit(EncryptionLevel::Initial);
        settle().await;

        let datagrams = sent(&transport);
        assert_eq!(datagrams.len(), 1);
        let packet = &datagrams[0][0];
        assert_eq!(packet.packet_number(), Some(0));
        assert!(packet.contains(FrameType::Ping));
        assert_eq!(
            transport.encoded_len(packet, EncryptionLevel::Initial),
            MIN_INITIAL_LENGTH - AEAD_OVERHEAD
        );
    }

    #[tokio::test]
    async fn test_unavailable_level_is_noop() {
        let (conn, transport) = test_connection();
        let _agents = start(&conn);
        conn.frame_queue
            .submit(QueuedFrame::new(Frame::Ping, EncryptionLevel::Handshake));
        conn.prepare_packet.submit(EncryptionLevel::Handshake);
        settle().await;
        assert!(sent(&transport).is_empty());
        assert_eq!(conn.next_packet_number(PnSpace::Handshake), 0);
    }

    #[tokio::test]
    async fn test_best_resolves_to_newest_level() {
        let (conn, transport) = test_connection();
        let _agents = start(&conn);
        conn.install_crypto_state(EncryptionLevel::Handshake, AEAD_OVERHEAD);
        conn.frame_queue
            .submit(QueuedFrame::new(Frame::Ping, EncryptionLevel::Best));
        conn.prepare_packet.submit(EncryptionLevel::Best);
        settle().await;
        let datagrams = sent(&transport);
        assert_eq!(datagrams.len(), 1);
        assert!(matches!(datagrams[0][0], Packet::Handshake(_)));
    }

    #[tokio::test]
    async fn test_first_initial_coalesces_zero_rtt() {
        let (conn, transport) = test_connection();
        let _agents = start(&conn);
        conn.install_crypto_state(EncryptionLevel::ZeroRtt, AEAD_OVERHEAD);
        conn.frame_queue.submit(QueuedFrame::new(
            Frame::Crypto {
                offset: 0,
                data: vec![1; 100],
            },
            EncryptionLevel::Initial,
        ));
        conn.frame_queue
            .submit(QueuedFrame::new(Frame::Ping, EncryptionLevel::ZeroRtt));
        conn.prepare_packet.submit(EncryptionLevel::Initial);
        settle().await;

        let datagrams = sent(&transport);
        assert_eq!(datagrams.len(), 1);
        let datagram = &datagrams[0];
        assert_eq!(datagram.len(), 2);
        assert!(matches!(datagram[0], Packet::Initial(_)));
        assert!(matches!(datagram[1], Packet::ZeroRtt(_)));
        let total: usize = datagram
            .iter()
            .map(|p| transport.encoded_len(p, p.encryption_level()))
            .sum();
        assert_eq!(total, MIN_INITIAL_LENGTH - AEAD_OVERHEAD);
    }

    #[tokio::test]
    async fn test_zero_rtt_waits_for_first_initial() {
        let (conn, transport) = test_connection();
        let _agents = start(&conn);
        conn.install_crypto_state(EncryptionLevel::ZeroRtt, AEAD_OVERHEAD);
        conn.frame_queue
            .submit(QueuedFrame::new(Frame::Ping, EncryptionLevel::ZeroRtt));
        conn.prepare_packet.submit(EncryptionLevel::ZeroRtt);
        settle().await;
        assert!(sent(&transport).is_empty());
    }

    #[tokio::test]
    async fn test_stopped_producer_is_dropped() {
        let (conn, transport) = test_connection();
        let (queue, _sending) = start(&conn);
        queue.stop();
        queue.join().await;
        conn.prepare_packet.submit(EncryptionLevel::Initial);
        settle().await;
        assert!(sent(&transport).is_empty());
        assert_eq!(conn.next_packet_number(PnSpace::Initial), 0);
    }
}
