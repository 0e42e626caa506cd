//! 引擎：连接记录之下的外部协作者
//!
//! - **Transport**: 把编码后的数据报送上网络（或送给内存中的对端）
//! - **Handshake**: TLS 握手协作者，消费 CRYPTO 数据、产出握手事件
//! - **EngineFactory**: 针对同一目标反复建立全新的连接（构造与 RESET 时使用）
//!
//! 比特级编解码与 TLS 状态机不在本 crate 的范围内；这里只定义接口，
//! 并提供 UDP 引擎（配合可替换的 `PacketCodec`）与测试用的内存引擎。

pub mod handshake;
pub mod memory;
pub mod udp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::EngineError;
use crate::quic::{Connection, EncryptionLevel, FramedPacket, Packet, TransportParameters};

pub use handshake::{HandshakeMessage, PlaintextHandshake};
pub use memory::{MemoryEngineFactory, Peer};
pub use udp::{JsonCodec, PacketCodec, UdpEngineFactory};

/// 数据报发送端
pub trait Transport: Send + Sync {
    /// 包加密编码后的字节数
    fn encoded_len(&self, packet: &Packet, level: EncryptionLevel) -> usize;

    /// 发送一个数据报；多个包时按顺序合并
    fn send_datagram(&self, packets: &[Packet]) -> Result<(), EngineError>;
}

/// 握手协作者产出的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// 需要在某级别发出的 CRYPTO 数据
    Data { level: EncryptionLevel, data: Vec<u8> },
    /// 某级别的密钥已就绪
    KeysReady(EncryptionLevel),
    /// 收到对端传输参数
    PeerParameters(TransportParameters),
    Complete,
}

pub trait Handshake: Send {
    /// （重新）开始握手，返回首个飞行的事件
    fn start(&mut self, local_params: TransportParameters) -> Vec<HandshakeEvent>;

    /// 按序交付某级别上新到达的 CRYPTO 数据
    fn on_crypto_data(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
    ) -> Result<Vec<HandshakeEvent>, EngineError>;
}

/// 一个活动连接及其握手协作者
pub struct Engine {
    pub connection: Arc<Connection>,
    pub handshake: Box<dyn Handshake>,
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn connect(&self) -> Result<Engine, EngineError>;
}

/// 引擎构造参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sul_address: String,
    pub server_name: String,
    pub local_params: TransportParameters,
}

/// 按头部与帧估算的线上长度（受保护级别附加 AEAD 开销）
pub fn estimated_len(packet: &Packet, level: EncryptionLevel) -> usize {
    let payload = packet
        .framed()
        .map(FramedPacket::payload_length)
        .unwrap_or(0);
    let overhead = match level {
        EncryptionLevel::None => 0,
        _ => crate::quic::AEAD_OVERHEAD,
    };
    packet.header_length() + payload + overhead
}
