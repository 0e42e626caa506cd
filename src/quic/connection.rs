//! 连接记录：一个活动 QUIC 连接的共享状态
//!
//! 连接记录只保存各 Agent 都需要读取的少量状态（连接 ID、包号、密钥可用性、保留帧队列），
//! 以及所有广播点与重启 / 关闭信号。其余状态各自归属于某一个 Agent 的循环。
//!
//! 包号计数器由独立的互斥锁保护：正常分配与空包回滚是唯一两条并发修改路径。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::broadcast::Broadcaster;
use super::frame::{Frame, FrameRequest, QueuedFrame};
use super::lock;
use super::packet::{FramedPacket, Header, LongHeader, Packet, ShortHeader};
use super::params::TransportParameters;
use super::types::{DirectionalEncryptionLevel, EncryptionLevel, PnSpace};
use crate::core::error::EngineError;
use crate::engine::Transport;

/// QUIC v1
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// AEAD 认证标签长度：每个受保护包的固定开销
pub const AEAD_OVERHEAD: usize = 16;

/// 等待发送的包及其加密级别（send-packet 广播点的载荷）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketToSend {
    pub packet: Packet,
    pub level: EncryptionLevel,
}

/// 某个加密级别的写方向密钥状态；这里只关心其开销
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoState {
    pub overhead: usize,
}

pub struct Connection {
    odcid: Vec<u8>,
    scid: Vec<u8>,
    dcid: Mutex<Vec<u8>>,
    version: AtomicU32,
    server_name: String,
    use_ipv6: bool,

    packet_numbers: Mutex<HashMap<PnSpace, u64>>,
    crypto_states: Mutex<HashMap<EncryptionLevel, CryptoState>>,
    retry_token: Mutex<Vec<u8>>,
    local_params: Mutex<TransportParameters>,
    held_frames: Mutex<HashMap<FrameRequest, VecDeque<QueuedFrame>>>,
    next_bidi_stream: AtomicU64,

    transport: Arc<dyn Transport>,

    pub incoming_packets: Broadcaster<Packet>,
    pub outgoing_packets: Broadcaster<Packet>,
    pub prepare_packet: Broadcaster<EncryptionLevel>,
    pub send_packet: Broadcaster<PacketToSend>,
    pub encryption_levels: Broadcaster<DirectionalEncryptionLevel>,
    pub transport_parameters: Broadcaster<TransportParameters>,
    pub frame_queue: Broadcaster<QueuedFrame>,

    restart: Mutex<CancellationToken>,
    restarted: watch::Sender<u64>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("odcid", &self.odcid_hex())
            .field("server_name", &self.server_name)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// 随机连接 ID（取 UUID v4 的前 8 字节）
fn random_cid() -> Vec<u8> {
    uuid::Uuid::new_v4().as_bytes()[..8].to_vec()
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Connection {
    /// 创建新连接；Initial 级别密钥由目的连接 ID 派生，构造时即可用
    pub fn new(
        transport: Arc<dyn Transport>,
        server_name: &str,
        use_ipv6: bool,
        local_params: TransportParameters,
    ) -> Arc<Self> {
        let odcid = random_cid();
        let (restarted, _) = watch::channel(0);
        let conn = Arc::new(Self {
            dcid: Mutex::new(odcid.clone()),
            odcid,
            scid: random_cid(),
            version: AtomicU32::new(QUIC_VERSION_1),
            server_name: server_name.to_string(),
            use_ipv6,
            packet_numbers: Mutex::new(HashMap::new()),
            crypto_states: Mutex::new(HashMap::new()),
            retry_token: Mutex::new(Vec::new()),
            local_params: Mutex::new(local_params),
            held_frames: Mutex::new(HashMap::new()),
            next_bidi_stream: AtomicU64::new(0),
            transport,
            incoming_packets: Broadcaster::new("incoming_packets"),
            outgoing_packets: Broadcaster::new("outgoing_packets"),
            prepare_packet: Broadcaster::new("prepare_packet"),
            send_packet: Broadcaster::new("send_packet"),
            encryption_levels: Broadcaster::new("encryption_levels"),
            transport_parameters: Broadcaster::new("transport_parameters"),
            frame_queue: Broadcaster::new("frame_queue"),
            restart: Mutex::new(CancellationToken::new()),
            restarted,
            closed: CancellationToken::new(),
        });
        conn.install_crypto_state(EncryptionLevel::Initial, AEAD_OVERHEAD);
        conn
    }

    pub fn odcid(&self) -> &[u8] {
        &self.odcid
    }

    pub fn odcid_hex(&self) -> String {
        hex(&self.odcid)
    }

    pub fn scid(&self) -> &[u8] {
        &self.scid
    }

    pub fn dcid(&self) -> Vec<u8> {
        lock(&self.dcid).clone()
    }

    pub fn set_dcid(&self, dcid: Vec<u8>) {
        *lock(&self.dcid) = dcid;
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::SeqCst);
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn use_ipv6(&self) -> bool {
        self.use_ipv6
    }

    pub fn retry_token(&self) -> Vec<u8> {
        lock(&self.retry_token).clone()
    }

    // ---- 包号 ----

    /// 分配该空间的下一个包号
    pub fn take_packet_number(&self, space: PnSpace) -> u64 {
        let mut pns = lock(&self.packet_numbers);
        let next = pns.entry(space).or_insert(0);
        let pn = *next;
        *next += 1;
        pn
    }

    /// 撤销最近一次分配（空包被丢弃时使用，避免包号跳跃）
    pub fn rollback_packet_number(&self, space: PnSpace) {
        let mut pns = lock(&self.packet_numbers);
        if let Some(next) = pns.get_mut(&space) {
            *next = next.saturating_sub(1);
        }
    }

    /// 覆盖下一个包号（查询符号显式指定包号时）
    pub fn set_packet_number(&self, space: PnSpace, next: u64) {
        lock(&self.packet_numbers).insert(space, next);
    }

    pub fn next_packet_number(&self, space: PnSpace) -> u64 {
        lock(&self.packet_numbers).get(&space).copied().unwrap_or(0)
    }

    /// 为某个具体加密级别构造空包壳并分配包号；虚拟级别或 None 返回 None
    pub fn new_packet(&self, level: EncryptionLevel) -> Option<Packet> {
        let long = |pn: u64, token: Vec<u8>| {
            Header::Long(LongHeader {
                version: self.version(),
                destination_cid: self.dcid(),
                source_cid: self.scid.clone(),
                token,
                packet_number: pn,
            })
        };
        let packet = match level {
            EncryptionLevel::Initial => {
                let pn = self.take_packet_number(PnSpace::Initial);
                Packet::Initial(FramedPacket::new(long(pn, self.retry_token())))
            }
            EncryptionLevel::Handshake => {
                let pn = self.take_packet_number(PnSpace::Handshake);
                Packet::Handshake(FramedPacket::new(long(pn, Vec::new())))
            }
            EncryptionLevel::ZeroRtt => {
                let pn = self.take_packet_number(PnSpace::AppData);
                Packet::ZeroRtt(FramedPacket::new(long(pn, Vec::new())))
            }
            EncryptionLevel::OneRtt => {
                let pn = self.take_packet_number(PnSpace::AppData);
                Packet::Short(FramedPacket::new(Header::Short(ShortHeader {
                    destination_cid: self.dcid(),
                    key_phase: false,
                    packet_number: pn,
                })))
            }
            _ => return None,
        };
        Some(packet)
    }

    // ---- 密钥 ----

    /// 安装某级别的密钥，并在 encryption-levels 广播点上宣布读写两个方向可用
    pub fn install_crypto_state(&self, level: EncryptionLevel, overhead: usize) {
        lock(&self.crypto_states).insert(level, CryptoState { overhead });
        for read in [true, false] {
            self.encryption_levels.submit(DirectionalEncryptionLevel {
                level,
                read,
                available: true,
            });
        }
    }

    /// 宣布某级别的写方向被丢弃；密钥状态本身保留，是否继续使用由发送 Agent 决定
    pub fn drop_crypto_state(&self, level: EncryptionLevel) {
        self.encryption_levels.submit(DirectionalEncryptionLevel {
            level,
            read: false,
            available: false,
        });
    }

    pub fn crypto_state(&self, level: EncryptionLevel) -> Option<CryptoState> {
        lock(&self.crypto_states).get(&level).copied()
    }

    pub fn crypto_overhead(&self, level: EncryptionLevel) -> usize {
        self.crypto_state(level).map(|s| s.overhead).unwrap_or(0)
    }

    // ---- 传输参数 ----

    pub fn local_params(&self) -> TransportParameters {
        *lock(&self.local_params)
    }

    pub fn update_local_params(&self, f: impl FnOnce(&mut TransportParameters)) {
        let mut params = lock(&self.local_params);
        f(&mut params);
    }

    // ---- 保留帧队列 ----

    /// 关闭了自动发帧的 Agent 把帧放进这里，等待编排器逐个释放
    pub fn hold_frame(&self, frame: QueuedFrame) {
        lock(&self.held_frames)
            .entry(frame.request())
            .or_default()
            .push_back(frame);
    }

    pub fn take_held(&self, request: FrameRequest) -> Option<QueuedFrame> {
        lock(&self.held_frames)
            .get_mut(&request)
            .and_then(VecDeque::pop_front)
    }

    /// 释放一个保留帧到 frame-queue 广播点；队列为空时返回 false
    pub fn release_held(&self, request: FrameRequest) -> bool {
        match self.take_held(request) {
            Some(frame) => {
                self.frame_queue.submit(frame);
                true
            }
            None => false,
        }
    }

    pub fn held_count(&self, request: FrameRequest) -> usize {
        lock(&self.held_frames)
            .get(&request)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn clear_held(&self, request: FrameRequest) {
        lock(&self.held_frames).remove(&request);
    }

    // ---- 流 ----

    /// 打开下一条客户端双向流
    pub fn open_bidi_stream(&self) -> u64 {
        self.next_bidi_stream.fetch_add(4, Ordering::SeqCst)
    }

    /// 下一条将被打开的客户端双向流（不占用）
    pub fn next_bidi_stream(&self) -> u64 {
        self.next_bidi_stream.load(Ordering::SeqCst)
    }

    /// 只有 `stream_id` 仍是下一条流时才占用它
    pub fn claim_bidi_stream(&self, stream_id: u64) -> bool {
        self.next_bidi_stream
            .compare_exchange(stream_id, stream_id + 4, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 最近一次打开的客户端双向流
    pub fn last_bidi_stream(&self) -> Option<u64> {
        self.next_bidi_stream
            .load(Ordering::SeqCst)
            .checked_sub(4)
    }

    // ---- 收发 ----

    /// 唯一入口：引擎把解码后的每个包交给这里
    pub fn receive(&self, packet: Packet) {
        if let Packet::Retry(retry) = &packet {
            tracing::info!(
                "Received Retry, switching DCID to {} and restarting",
                hex(&retry.source_cid)
            );
            *lock(&self.retry_token) = retry.token.clone();
            self.set_dcid(retry.source_cid.clone());
            self.request_restart();
        }
        self.incoming_packets.submit(packet);
    }

    pub fn encoded_len(&self, packet: &Packet, level: EncryptionLevel) -> usize {
        self.transport.encoded_len(packet, level)
    }

    pub fn send_packet(&self, packet: Packet) -> Result<(), EngineError> {
        self.send_coalesced(vec![packet])
    }

    /// 多个包合并进同一个数据报发送
    pub fn send_coalesced(&self, packets: Vec<Packet>) -> Result<(), EngineError> {
        self.transport.send_datagram(&packets)?;
        for packet in packets {
            tracing::debug!("Sent packet {}", packet.short_string());
            self.outgoing_packets.submit(packet);
        }
        Ok(())
    }

    /// 排入 CONNECTION_CLOSE（传输层）或 APPLICATION_CLOSE，并请求以最佳级别发包
    pub fn close_connection(&self, quic_layer: bool, error_code: u64, reason: &str) {
        let frame = if quic_layer {
            Frame::ConnectionClose {
                error_code,
                frame_type: 0,
                reason: reason.to_string(),
            }
        } else {
            Frame::ApplicationClose {
                error_code,
                reason: reason.to_string(),
            }
        };
        self.frame_queue
            .submit(QueuedFrame::new(frame, EncryptionLevel::Best));
        self.prepare_packet.submit(EncryptionLevel::Best);
    }

    // ---- 信号 ----

    pub fn request_restart(&self) {
        lock(&self.restart).cancel();
    }

    /// 当前这一轮的重启信号
    pub fn restart_signal(&self) -> CancellationToken {
        lock(&self.restart).clone()
    }

    /// 重启处理完毕后换上新的信号，以便后续再次重启
    pub fn rearm_restart(&self) {
        *lock(&self.restart) = CancellationToken::new();
    }

    pub fn mark_restarted(&self) {
        self.restarted.send_modify(|n| *n += 1);
    }

    /// 已完成的重启次数
    pub fn restarted(&self) -> watch::Receiver<u64> {
        self.restarted.subscribe()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 宣告连接已关闭（幂等）
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!("Connection {} closed", self.odcid_hex());
        }
        self.closed.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::quic::frame::FrameType;
    use crate::quic::packet::RetryPacket;

    /// 记录发出数据报的测试传输层
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<Vec<Packet>>>,
    }

    impl Transport for RecordingTransport {
        fn encoded_len(&self, packet: &Packet, level: EncryptionLevel) -> usize {
            let _ = level;
            packet.header_length()
                + packet
                    .framed()
                    .map(FramedPacket::payload_length)
                    .unwrap_or(0)
        }

        fn send_datagram(&self, packets: &[Packet]) -> Result<(), EngineError> {
            self.sent.lock().unwrap().push(packets.to_vec());
            Ok(())
        }
    }

    pub(crate) fn test_connection() -> (Arc<Connection>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let conn = Connection::new(
            transport.clone(),
            "quic.example",
            false,
            TransportParameters::default(),
        );
        (conn, transport)
    }

    #[test]
    fn test_packet_number_take_and_rollback() {
        let (conn, _) = test_connection();
        assert_eq!(conn.take_packet_number(PnSpace::Initial), 0);
        assert_eq!(conn.take_packet_number(PnSpace::Initial), 1);
        conn.rollback_packet_number(PnSpace::Initial);
        assert_eq!(conn.next_packet_number(PnSpace::Initial), 1);
        assert_eq!(conn.next_packet_number(PnSpace::Handshake), 0);
        conn.set_packet_number(PnSpace::AppData, 25);
        assert_eq!(conn.take_packet_number(PnSpace::AppData), 25);
    }

    #[test]
    fn test_initial_keys_available_at_start() {
        let (conn, _) = test_connection();
        assert!(conn.crypto_state(EncryptionLevel::Initial).is_some());
        assert!(conn.crypto_state(EncryptionLevel::Handshake).is_none());
        assert_eq!(conn.crypto_overhead(EncryptionLevel::Initial), AEAD_OVERHEAD);
    }

    #[test]
    fn test_new_packet_only_for_concrete_levels() {
        let (conn, _) = test_connection();
        assert!(conn.new_packet(EncryptionLevel::Best).is_none());
        assert!(conn.new_packet(EncryptionLevel::None).is_none());
        let p = conn.new_packet(EncryptionLevel::OneRtt).unwrap();
        assert_eq!(p.packet_number(), Some(0));
        assert_eq!(conn.next_packet_number(PnSpace::AppData), 1);
    }

    #[test]
    fn test_held_frames_fifo() {
        let (conn, _) = test_connection();
        let mut sub = conn.frame_queue.subscribe();
        let req = FrameRequest::new(FrameType::Ping, EncryptionLevel::Initial);
        assert!(!conn.release_held(req));
        conn.hold_frame(QueuedFrame::new(Frame::Ping, EncryptionLevel::Initial));
        conn.hold_frame(QueuedFrame::new(Frame::Ping, EncryptionLevel::Initial));
        assert_eq!(conn.held_count(req), 2);
        assert!(conn.release_held(req));
        assert_eq!(conn.held_count(req), 1);
        assert_eq!(sub.try_recv().map(|q| q.level), Some(EncryptionLevel::Initial));
    }

    #[test]
    fn test_stream_ids_allocated_in_order() {
        let (conn, _) = test_connection();
        assert_eq!(conn.last_bidi_stream(), None);
        assert_eq!(conn.open_bidi_stream(), 0);
        assert_eq!(conn.open_bidi_stream(), 4);
        assert_eq!(conn.last_bidi_stream(), Some(4));
        assert_eq!(conn.next_bidi_stream(), 8);
        assert!(!conn.claim_bidi_stream(4));
        assert!(conn.claim_bidi_stream(8));
        assert_eq!(conn.last_bidi_stream(), Some(8));
    }

    #[tokio::test]
    async fn test_retry_updates_token_and_requests_restart() {
        let (conn, _) = test_connection();
        let mut incoming = conn.incoming_packets.subscribe();
        let signal = conn.restart_signal();
        conn.receive(Packet::Retry(RetryPacket {
            version: QUIC_VERSION_1,
            destination_cid: conn.scid().to_vec(),
            source_cid: vec![7; 8],
            token: vec![1, 2, 3],
            integrity_tag: vec![0; 16],
        }));
        assert!(signal.is_cancelled());
        assert_eq!(conn.dcid(), vec![7; 8]);
        assert_eq!(conn.retry_token(), vec![1, 2, 3]);
        assert!(incoming.recv().await.is_some());

        conn.rearm_restart();
        assert!(!conn.restart_signal().is_cancelled());
        let p = conn.new_packet(EncryptionLevel::Initial).unwrap();
        match p.header() {
            Some(Header::Long(h)) => assert_eq!(h.token, vec![1, 2, 3]),
            other => panic!("unexpected header {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_broadcasts_outgoing() {
        let (conn, transport) = test_connection();
        let mut outgoing = conn.outgoing_packets.subscribe();
        let p = conn.new_packet(EncryptionLevel::Initial).unwrap();
        conn.send_packet(p.clone()).unwrap();
        assert_eq!(outgoing.recv().await, Some(p));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }
}
