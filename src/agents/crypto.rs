//! 加密 Agent：在 CRYPTO 帧与握手协作者之间搬运数据
//!
//! 每次启动（包括 Retry 引起的重启）都会清空已保留的 CRYPTO 帧、重置发送偏移并重新开始握手。
//! 入站 CRYPTO 数据按偏移重组后按序交给握手协作者；握手事件转换为密钥安装、
//! 传输参数发布以及新的出站 CRYPTO 帧。

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::Instrument;

use super::{Agent, AgentBase};
use crate::engine::{Handshake, HandshakeEvent};
use crate::quic::{
    lock, Connection, EncryptionLevel, Frame, FrameRequest, FrameType, Packet, QueuedFrame,
    AEAD_OVERHEAD,
};

/// 单个 CRYPTO 帧携带的最大数据量
const MAX_CRYPTO_FRAME_DATA: usize = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoSettings {
    /// 为 true 时 CRYPTO 帧只保留在连接上，等待编排器释放
    pub disable_frame_sending: bool,
}

/// 单个加密级别上的入站重组缓冲
#[derive(Debug, Default)]
struct Reassembly {
    next_offset: u64,
    pending: BTreeMap<u64, Vec<u8>>,
}

impl Reassembly {
    /// 放入一段数据，返回新得到的连续字节；结束偏移溢出的片段直接丢弃
    fn push(&mut self, offset: u64, data: &[u8]) -> Vec<u8> {
        let Some(end) = offset.checked_add(data.len() as u64) else {
            tracing::warn!("Dropping CRYPTO fragment at offset {}: end overflows", offset);
            return Vec::new();
        };
        if end > self.next_offset {
            let skip = self.next_offset.saturating_sub(offset) as usize;
            let start = offset.max(self.next_offset);
            self.pending.entry(start).or_insert_with(|| data[skip..].to_vec());
        }

        let mut out = Vec::new();
        while let Some((&start, _)) = self.pending.first_key_value() {
            if start > self.next_offset {
                break;
            }
            let Some((start, chunk)) = self.pending.pop_first() else {
                break;
            };
            let chunk_end = start + chunk.len() as u64;
            if chunk_end > self.next_offset {
                let skip = (self.next_offset - start) as usize;
                out.extend_from_slice(&chunk[skip..]);
                self.next_offset = chunk_end;
            }
        }
        out
    }
}

pub struct CryptoAgent {
    base: AgentBase,
    settings: CryptoSettings,
    handshake: Arc<Mutex<Box<dyn Handshake>>>,
}

impl CryptoAgent {
    pub fn new(settings: CryptoSettings, handshake: Box<dyn Handshake>) -> Arc<Self> {
        Arc::new(Self {
            base: AgentBase::new("CryptoAgent"),
            settings,
            handshake: Arc::new(Mutex::new(handshake)),
        })
    }
}

struct CryptoLoop {
    conn: Arc<Connection>,
    settings: CryptoSettings,
    handshake: Arc<Mutex<Box<dyn Handshake>>>,
    send_offsets: HashMap<EncryptionLevel, u64>,
    inbound: HashMap<EncryptionLevel, Reassembly>,
}

impl CryptoLoop {
    fn start(&mut self) {
        for level in [
            EncryptionLevel::Initial,
            EncryptionLevel::Handshake,
            EncryptionLevel::OneRtt,
        ] {
            self.conn
                .clear_held(FrameRequest::new(FrameType::Crypto, level));
        }
        self.send_offsets.clear();
        self.inbound.clear();
        let params = self.conn.local_params();
        let events = lock(&self.handshake).start(params);
        self.apply(events);
    }

    fn on_packet(&mut self, packet: &Packet) {
        let level = packet.encryption_level();
        for frame in packet.frames() {
            match frame {
                Frame::Crypto { offset, data } => {
                    let fresh = self.inbound.entry(level).or_default().push(*offset, data);
                    if fresh.is_empty() {
                        continue;
                    }
                    let result = lock(&self.handshake).on_crypto_data(level, &fresh);
                    match result {
                        Ok(events) => self.apply(events),
                        Err(e) => tracing::warn!("Handshake failed at {}: {}", level, e),
                    }
                }
                Frame::HandshakeDone => {
                    tracing::info!("Handshake confirmed, dropping Handshake keys");
                    self.conn.drop_crypto_state(EncryptionLevel::Handshake);
                }
                _ => {}
            }
        }
    }

    fn apply(&mut self, events: Vec<HandshakeEvent>) {
        for event in events {
            match event {
                HandshakeEvent::Data { level, data } => self.send(level, &data),
                HandshakeEvent::KeysReady(level) => {
                    tracing::info!("Installing {} keys", level);
                    self.conn.install_crypto_state(level, AEAD_OVERHEAD);
                }
                HandshakeEvent::PeerParameters(params) => {
                    tracing::info!("Received peer transport parameters");
                    self.conn.transport_parameters.submit(params);
                }
                HandshakeEvent::Complete => {
                    tracing::info!("Handshake complete");
                    self.conn.drop_crypto_state(EncryptionLevel::Initial);
                }
            }
        }
    }

    fn send(&mut self, level: EncryptionLevel, data: &[u8]) {
        for chunk in data.chunks(MAX_CRYPTO_FRAME_DATA) {
            let offset = self.send_offsets.entry(level).or_insert(0);
            let frame = QueuedFrame::new(
                Frame::Crypto {
                    offset: *offset,
                    data: chunk.to_vec(),
                },
                level,
            );
            *offset += chunk.len() as u64;
            if self.settings.disable_frame_sending {
                self.conn.hold_frame(frame);
            } else {
                self.conn.frame_queue.submit(frame);
            }
        }
    }
}

impl Agent for CryptoAgent {
    fn base(&self) -> &AgentBase {
        &self.base
    }

    fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let mut ctx = self.base.init(&conn);
        let mut incoming = conn.incoming_packets.subscribe();
        let span = ctx.span();

        let mut state = CryptoLoop {
            conn,
            settings: self.settings,
            handshake: self.handshake.clone(),
            send_offsets: HashMap::new(),
            inbound: HashMap::new(),
        };
        span.in_scope(|| state.start());

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.closing() => break,
                        Some(packet) = incoming.recv() => state.on_packet(&packet),
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
