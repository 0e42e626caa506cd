//! 流量控制 Agent：记录本地与对端的额度，校验入站数据，管理出站预留
//!
//! 额度在收到传输参数后才生效；此前任何预留都得到 0。
//!
//! - 提升额度的帧（MAX_DATA / MAX_STREAMS / MAX_STREAM_DATA）只有在确实提升时才生效，
//!   对应的阻塞标记也只在确实提升时清除。
//! - 阻塞信号（DATA_BLOCKED / STREAM_DATA_BLOCKED / STREAMS_BLOCKED）每次进入阻塞状态只发一次。
//! - 对端超出我方限制只记录为 `FlowControlViolation`，不中断连接。
//! - 关闭发帧时，所有控制帧按 (帧种类, 级别) 保留在连接上，由编排器逐个释放。

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use super::producer::{FrameProducer, FrameSpace};
use super::{Agent, AgentBase, Rendezvous};
use crate::core::error::FlowControlViolation;
use crate::quic::params::{
    is_bidi_client, is_bidi_server, is_uni, is_uni_client, is_uni_server, max_bidi_client,
    max_bidi_server, max_uni_client, max_uni_server,
};
use crate::quic::{
    Connection, EncryptionLevel, Frame, FrameRequest, FrameType, Packet, PnSpace, QueuedFrame,
    StreamsType, TransportParameters,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct FlowControlSettings {
    pub disable_frame_sending: bool,
    pub dont_slide_credit_window: bool,
    /// 队列为空时合成 MAX_STREAM_DATA 所用的本地流读取上限
    pub synthesized_stream_limit: u64,
}

/// 一方的流量控制额度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlLimits {
    pub max_data: u64,
    pub max_bidi_streams: u64,
    pub max_uni_streams: u64,
    pub max_stream_data_bidi_local: u64,
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
}

impl From<TransportParameters> for FlowControlLimits {
    fn from(p: TransportParameters) -> Self {
        Self {
            max_data: p.max_data,
            max_bidi_streams: p.max_bidi_streams,
            max_uni_streams: p.max_uni_streams,
            max_stream_data_bidi_local: p.max_stream_data_bidi_local,
            max_stream_data_bidi_remote: p.max_stream_data_bidi_remote,
            max_stream_data_uni: p.max_stream_data_uni,
        }
    }
}

/// 单条流的额度；限制的含义取决于流的方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCredit {
    pub write_limit: u64,
    pub write_reserved: u64,
    pub read_limit: u64,
    pub read_offset: u64,
}

impl StreamCredit {
    fn initial(stream_id: u64, local: &FlowControlLimits, remote: &FlowControlLimits) -> Self {
        let write_limit = if is_uni_client(stream_id) {
            remote.max_stream_data_uni
        } else if is_bidi_client(stream_id) {
            remote.max_stream_data_bidi_remote
        } else if is_bidi_server(stream_id) {
            remote.max_stream_data_bidi_local
        } else {
            0
        };
        let read_limit = if is_uni_server(stream_id) {
            local.max_stream_data_uni
        } else if is_bidi_client(stream_id) {
            local.max_stream_data_bidi_local
        } else if is_bidi_server(stream_id) {
            local.max_stream_data_bidi_remote
        } else {
            0
        };
        Self {
            write_limit,
            read_limit,
            ..Self::default()
        }
    }
}

/// Agent 状态的只读副本
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowControlSnapshot {
    pub ready: bool,
    pub local: FlowControlLimits,
    pub remote: FlowControlLimits,
    pub data_reserved: u64,
    pub data_read: u64,
    pub streams: BTreeMap<u64, StreamCredit>,
    pub data_blocked: bool,
    pub bidi_streams_blocked: bool,
    pub uni_streams_blocked: bool,
    pub blocked_streams: BTreeSet<u64>,
    pub violations: Vec<FlowControlViolation>,
}

/// 一次出站额度预留
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub stream_id: u64,
    pub credit: u64,
    /// 为 true 时允许只批准一部分
    pub partial: bool,
}

/// 不依赖任务与通道的流量控制状态，Agent 循环在其上执行所有操作
#[derive(Debug, Default)]
pub struct FlowControlState {
    snap: FlowControlSnapshot,
    slide_window: bool,
    max_data_changed: bool,
    stream_updates: BTreeMap<u64, u64>,
}

impl FlowControlState {
    pub fn new(slide_window: bool) -> Self {
        Self {
            slide_window,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> &FlowControlSnapshot {
        &self.snap
    }

    pub fn on_parameters(&mut self, local: TransportParameters, remote: TransportParameters) {
        self.snap.ready = true;
        self.snap.local = local.into();
        self.snap.remote = remote.into();
        tracing::info!(
            "Flow control seeded: local max_data={}, remote max_data={}",
            self.snap.local.max_data,
            self.snap.remote.max_data
        );
    }

    fn stream(&mut self, stream_id: u64) -> &mut StreamCredit {
        let (local, remote) = (self.snap.local, self.snap.remote);
        self.snap
            .streams
            .entry(stream_id)
            .or_insert_with(|| StreamCredit::initial(stream_id, &local, &remote))
    }

    fn violation(&mut self, v: FlowControlViolation) {
        tracing::warn!("Flow control violation: {}", v);
        self.snap.violations.push(v);
    }

    /// 处理对端发来的一个帧
    pub fn on_frame(&mut self, frame: &Frame) {
        match frame {
            Frame::MaxData { maximum_data } => {
                let remote = &mut self.snap.remote;
                if *maximum_data < remote.max_data {
                    tracing::debug!(
                        "Ignoring non-increasing MAX_DATA {} (current {})",
                        maximum_data,
                        remote.max_data
                    );
                    return;
                }
                if *maximum_data > remote.max_data {
                    self.snap.data_blocked = false;
                }
                remote.max_data = *maximum_data;
            }
            Frame::MaxStreams {
                streams_type,
                maximum_streams,
            } => {
                let (current, blocked) = match streams_type {
                    StreamsType::Bidi => (
                        &mut self.snap.remote.max_bidi_streams,
                        &mut self.snap.bidi_streams_blocked,
                    ),
                    StreamsType::Uni => (
                        &mut self.snap.remote.max_uni_streams,
                        &mut self.snap.uni_streams_blocked,
                    ),
                };
                if *maximum_streams < *current {
                    tracing::debug!(
                        "Ignoring non-increasing MAX_STREAMS {} (current {})",
                        maximum_streams,
                        current
                    );
                    return;
                }
                if *maximum_streams > *current {
                    *blocked = false;
                }
                *current = *maximum_streams;
            }
            Frame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => {
                if is_uni_server(*stream_id) {
                    self.violation(FlowControlViolation::ReceiveOnlyStream {
                        stream_id: *stream_id,
                    });
                    return;
                }
                let stream = self.stream(*stream_id);
                if *maximum_stream_data < stream.write_limit {
                    tracing::debug!(
                        "Ignoring non-increasing MAX_STREAM_DATA {} for stream {}",
                        maximum_stream_data,
                        stream_id
                    );
                    return;
                }
                let increased = *maximum_stream_data > stream.write_limit;
                stream.write_limit = *maximum_stream_data;
                if increased {
                    self.snap.blocked_streams.remove(stream_id);
                }
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => self.on_stream_data(*stream_id, *offset, data.len() as u64),
            _ => {}
        }
    }

    fn stream_permitted(&self, stream_id: u64) -> bool {
        let local = &self.snap.local;
        if is_bidi_server(stream_id) {
            max_bidi_server(local.max_bidi_streams).is_some_and(|max| stream_id <= max)
        } else if is_uni_server(stream_id) {
            max_uni_server(local.max_uni_streams).is_some_and(|max| stream_id <= max)
        } else {
            true
        }
    }

    fn on_stream_data(&mut self, stream_id: u64, offset: u64, len: u64) {
        if !self.stream_permitted(stream_id) {
            self.violation(FlowControlViolation::StreamNotPermitted { stream_id });
            return;
        }
        let Some(end) = offset.checked_add(len) else {
            let limit = self.stream(stream_id).read_limit;
            self.violation(FlowControlViolation::StreamLimitExceeded {
                stream_id,
                end: u64::MAX,
                limit,
            });
            return;
        };
        let stream = *self.stream(stream_id);
        if end > stream.read_limit {
            self.violation(FlowControlViolation::StreamLimitExceeded {
                stream_id,
                end,
                limit: stream.read_limit,
            });
            return;
        }
        if end <= stream.read_offset {
            // 重传
            return;
        }
        let fresh = end - stream.read_offset;
        let consumed = self.snap.data_read + fresh;
        if consumed > self.snap.local.max_data {
            self.violation(FlowControlViolation::ConnectionLimitExceeded {
                consumed,
                limit: self.snap.local.max_data,
            });
            return;
        }
        self.snap.data_read = consumed;
        let slide = self.slide_window;
        let s = self.stream(stream_id);
        s.read_offset = end;
        if slide {
            s.read_limit += fresh;
            let limit = s.read_limit;
            self.stream_updates.insert(stream_id, limit);
            self.snap.local.max_data += fresh;
            self.max_data_changed = true;
        }
    }

    /// 预留出站额度，返回批准的字节数以及需要发出的阻塞信号
    pub fn reserve(&mut self, r: Reservation) -> (u64, Vec<Frame>) {
        let mut signals = Vec::new();
        if !self.snap.ready {
            return (0, signals);
        }
        let Reservation {
            stream_id,
            credit,
            partial,
        } = r;

        if is_bidi_client(stream_id) || is_uni_client(stream_id) {
            let uni = is_uni(stream_id);
            let (count, max_id, blocked) = if uni {
                let c = self.snap.remote.max_uni_streams;
                (c, max_uni_client(c), &mut self.snap.uni_streams_blocked)
            } else {
                let c = self.snap.remote.max_bidi_streams;
                (c, max_bidi_client(c), &mut self.snap.bidi_streams_blocked)
            };
            if !max_id.is_some_and(|max| stream_id <= max) {
                if !*blocked {
                    *blocked = true;
                    signals.push(Frame::StreamsBlocked {
                        streams_type: if uni { StreamsType::Uni } else { StreamsType::Bidi },
                        limit: count,
                    });
                }
                return (0, signals);
            }
        }

        let remote_max_data = self.snap.remote.max_data;
        let data_reserved = self.snap.data_reserved;
        let stream = self.stream(stream_id);
        let available_stream = stream.write_limit.saturating_sub(stream.write_reserved);
        let available_conn = remote_max_data.saturating_sub(data_reserved);

        let mut granted = 0;
        let wanted = if partial {
            credit.min(available_stream).min(available_conn)
        } else {
            credit
        };
        if wanted <= available_stream && wanted <= available_conn {
            stream.write_reserved += wanted;
            granted = wanted;
        }
        let stream = *stream;
        self.snap.data_reserved += granted;

        let short = granted < credit;
        if !self.snap.blocked_streams.contains(&stream_id)
            && (stream.write_reserved >= stream.write_limit
                || (short && credit > available_stream))
        {
            self.snap.blocked_streams.insert(stream_id);
            signals.push(Frame::StreamDataBlocked {
                stream_id,
                limit: stream.write_limit,
            });
        }
        if !self.snap.data_blocked
            && (self.snap.data_reserved >= remote_max_data || (short && credit > available_conn))
        {
            self.snap.data_blocked = true;
            signals.push(Frame::DataBlocked {
                limit: remote_max_data,
            });
        }
        (granted, signals)
    }

    /// 滑动窗口产生的额度更新，按顺序取出放得下的部分
    pub fn pending_updates(&mut self, available: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut left = available;
        if self.max_data_changed {
            let frame = Frame::MaxData {
                maximum_data: self.snap.local.max_data,
            };
            if frame.length() <= left {
                left -= frame.length();
                frames.push(frame);
                self.max_data_changed = false;
            }
        }
        let ids: Vec<u64> = self.stream_updates.keys().copied().collect();
        for stream_id in ids {
            let Some(&limit) = self.stream_updates.get(&stream_id) else {
                continue;
            };
            let frame = Frame::MaxStreamData {
                stream_id,
                maximum_stream_data: limit,
            };
            if frame.length() > left {
                break;
            }
            left -= frame.length();
            frames.push(frame);
            self.stream_updates.remove(&stream_id);
        }
        frames
    }

    /// 提升本地流读取上限（合成 MAX_STREAM_DATA 时使用）
    fn raise_read_limit(&mut self, stream_id: u64, limit: u64) {
        self.snap.local.max_stream_data_bidi_local =
            self.snap.local.max_stream_data_bidi_local.max(limit);
        let s = self.stream(stream_id);
        s.read_limit = s.read_limit.max(limit);
    }
}

pub struct FlowControlAgent {
    base: AgentBase,
    settings: FlowControlSettings,
    produce: Rendezvous<FrameSpace, Vec<Frame>>,
    reserve: Rendezvous<Reservation, u64>,
    queue: Rendezvous<FrameRequest, bool>,
    snapshot: Rendezvous<(), FlowControlSnapshot>,
}

impl FlowControlAgent {
    pub fn new(settings: FlowControlSettings) -> Arc<Self> {
        Arc::new(Self {
            base: AgentBase::new("FlowControlAgent"),
            settings,
            produce: Rendezvous::new(),
            reserve: Rendezvous::new(),
            queue: Rendezvous::new(),
            snapshot: Rendezvous::new(),
        })
    }

    /// 全额预留；额度不足时返回 0
    pub async fn reserve_exact(&self, stream_id: u64, credit: u64) -> u64 {
        self.reserve_with(stream_id, credit, false).await
    }

    /// 尽量预留，最多 `credit` 字节
    pub async fn reserve_at_most(&self, stream_id: u64, credit: u64) -> u64 {
        self.reserve_with(stream_id, credit, true).await
    }

    async fn reserve_with(&self, stream_id: u64, credit: u64, partial: bool) -> u64 {
        let r = Reservation {
            stream_id,
            credit,
            partial,
        };
        self.reserve.call(&self.base, r).await.unwrap_or(0)
    }

    /// 释放一个保留的控制帧；队列为空时为 MAX_DATA / MAX_STREAM_DATA 合成新帧
    pub async fn send_from_queue(&self, request: FrameRequest) -> bool {
        self.queue
            .call(&self.base, request)
            .await
            .unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Option<FlowControlSnapshot> {
        self.snapshot.call(&self.base, ()).await
    }
}

struct FlowControlLoop {
    conn: Arc<Connection>,
    settings: FlowControlSettings,
    state: FlowControlState,
}

impl FlowControlLoop {
    fn emit(&self, frame: Frame, level: EncryptionLevel) {
        let queued = QueuedFrame::new(frame, level);
        if self.settings.disable_frame_sending {
            tracing::debug!("Holding {} frame at {}", queued.frame_type(), level);
            self.conn.hold_frame(queued);
        } else {
            self.conn.frame_queue.submit(queued);
        }
    }

    fn on_packet(&mut self, packet: &Packet) {
        if !matches!(packet, Packet::Short(_) | Packet::ZeroRtt(_)) {
            return;
        }
        for frame in packet.frames() {
            self.state.on_frame(frame);
        }
    }

    fn reserve(&mut self, r: Reservation) -> u64 {
        let (granted, signals) = self.state.reserve(r);
        for frame in signals {
            self.emit(frame, EncryptionLevel::BestAppData);
        }
        granted
    }

    fn send_from_queue(&mut self, request: FrameRequest) -> bool {
        if self.conn.release_held(request) {
            return true;
        }
        let frame = match request.frame_type {
            FrameType::MaxData => {
                let maximum_data = if self.state.snap.ready {
                    self.state.snap.local.max_data
                } else {
                    self.conn.local_params().max_data
                };
                Frame::MaxData { maximum_data }
            }
            FrameType::MaxStreamData => {
                let Some(stream_id) = self.conn.last_bidi_stream() else {
                    tracing::info!("No client stream opened yet, nothing to send for MAX_STREAM_DATA");
                    return false;
                };
                let limit = self.settings.synthesized_stream_limit;
                self.conn
                    .update_local_params(|p| p.max_stream_data_bidi_local = limit);
                self.state.raise_read_limit(stream_id, limit);
                Frame::MaxStreamData {
                    stream_id,
                    maximum_stream_data: limit,
                }
            }
            _ => return false,
        };
        tracing::info!(
            "Flow control queue empty, sending new {} frame at {}",
            frame.frame_type(),
            request.level
        );
        self.conn
            .frame_queue
            .submit(QueuedFrame::new(frame, request.level));
        true
    }

    fn produce(&mut self, space: FrameSpace) -> Vec<Frame> {
        if space.level.pn_space() != PnSpace::AppData {
            return Vec::new();
        }
        let frames = self.state.pending_updates(space.available_space);
        if self.settings.disable_frame_sending {
            for frame in frames {
                self.emit(frame, space.level);
            }
            return Vec::new();
        }
        frames
    }
}

impl Agent for FlowControlAgent {
    fn base(&self) -> &AgentBase {
        &self.base
    }

    fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let mut ctx = self.base.init(&conn);
        let mut params = conn.transport_parameters.subscribe();
        let mut incoming = conn.incoming_packets.subscribe();
        let mut produce = self.produce.open();
        let mut reserve = self.reserve.open();
        let mut queue = self.queue.open();
        let mut snapshot = self.snapshot.open();
        let span = ctx.span();

        let mut fc = FlowControlLoop {
            conn,
            settings: self.settings,
            state: FlowControlState::new(!self.settings.dont_slide_credit_window),
        };

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.closing() => break,
                        Some(remote) = params.recv() => {
                            let local = fc.conn.local_params();
                            fc.state.on_parameters(local, remote);
                        }
                        Some(packet) = incoming.recv() => fc.on_packet(&packet),
                        Some(call) = reserve.recv() => {
                            let granted = fc.reserve(call.args);
                            call.reply(granted);
                        }
                        Some(call) = queue.recv() => {
                            let sent = fc.send_from_queue(call.args);
                            call.reply(sent);
                        }
                        Some(call) = produce.recv() => {
                            let frames = fc.produce(call.args);
                            call.reply(frames);
                        }
                        Some(call) = snapshot.recv() => {
                            call.reply(fc.state.snapshot().clone());
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
impl FrameProducer for FlowControlAgent {
    fn producer_name(&self) -> &'static str {
        self.base.name()
    }

    async fn request_frames(&self, space: FrameSpace) -> (Vec<Frame>, bool) {
        match self.produce.call(&self.base, space).await {
            Some(frames) => (frames, true),
            None => (Vec::new(), false),
        }
    }
}
