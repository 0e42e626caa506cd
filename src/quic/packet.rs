//! 包模型：封闭的包种类联合体
//!
//! 具体的比特级编解码属于引擎（见 `engine::PacketCodec`），这里只保留语义字段与长度估算。

use serde::{Deserialize, Serialize};

use super::frame::{varint_len, Frame, FrameType};
use super::types::{EncryptionLevel, PacketType, PnSpace};

/// 发送端包号统一按 4 字节编码
pub const PACKET_NUMBER_LENGTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LongHeader {
    pub version: u32,
    pub destination_cid: Vec<u8>,
    pub source_cid: Vec<u8>,
    /// 仅 Initial 包携带
    #[serde(default)]
    pub token: Vec<u8>,
    pub packet_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShortHeader {
    pub destination_cid: Vec<u8>,
    pub key_phase: bool,
    pub packet_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "form")]
pub enum Header {
    Long(LongHeader),
    Short(ShortHeader),
}

impl Header {
    pub fn packet_number(&self) -> u64 {
        match self {
            Header::Long(h) => h.packet_number,
            Header::Short(h) => h.packet_number,
        }
    }

    pub fn version(&self) -> Option<u32> {
        match self {
            Header::Long(h) => Some(h.version),
            Header::Short(_) => None,
        }
    }

    /// 头部长度（含 Length 字段与包号）
    pub fn length(&self) -> usize {
        match self {
            Header::Long(h) => {
                let token = if h.token.is_empty() {
                    0
                } else {
                    varint_len(h.token.len() as u64) + h.token.len()
                };
                1 + 4 + 1 + h.destination_cid.len() + 1 + h.source_cid.len() + token + 2
                    + PACKET_NUMBER_LENGTH
            }
            Header::Short(h) => 1 + h.destination_cid.len() + PACKET_NUMBER_LENGTH,
        }
    }
}

/// 携带帧的包（Initial / Handshake / 0-RTT / 1-RTT）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FramedPacket {
    pub header: Header,
    pub frames: Vec<Frame>,
}

impl FramedPacket {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            frames: Vec::new(),
        }
    }

    pub fn payload_length(&self) -> usize {
        self.frames.iter().map(Frame::length).sum()
    }

    /// 追加 PADDING，使头部 + 载荷至少达到 `target` 字节
    pub fn pad_to(&mut self, target: usize) {
        let current = self.header.length() + self.payload_length();
        if current < target {
            self.frames.push(Frame::Padding {
                length: target - current,
            });
        }
    }

    pub fn strip_padding(&mut self) {
        self.frames
            .retain(|f| f.frame_type() != FrameType::Padding);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryPacket {
    pub version: u32,
    pub destination_cid: Vec<u8>,
    pub source_cid: Vec<u8>,
    pub token: Vec<u8>,
    pub integrity_tag: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionNegotiationPacket {
    pub destination_cid: Vec<u8>,
    pub source_cid: Vec<u8>,
    pub supported_versions: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatelessResetPacket {
    pub reset_token: Vec<u8>,
}

/// 协议包；JSON 中以 `type` 字段保留具体种类
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    Initial(FramedPacket),
    Handshake(FramedPacket),
    ZeroRtt(FramedPacket),
    Short(FramedPacket),
    Retry(RetryPacket),
    VersionNegotiation(VersionNegotiationPacket),
    StatelessReset(StatelessResetPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Initial(_) => PacketType::Initial,
            Packet::Handshake(_) => PacketType::Handshake,
            Packet::ZeroRtt(_) => PacketType::ZeroRtt,
            Packet::Short(_) => PacketType::Short,
            Packet::Retry(_) => PacketType::Retry,
            Packet::VersionNegotiation(_) => PacketType::VersionNegotiation,
            Packet::StatelessReset(_) => PacketType::StatelessReset,
        }
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.packet_type().encryption_level()
    }

    pub fn pn_space(&self) -> PnSpace {
        self.packet_type().pn_space()
    }

    pub fn framed(&self) -> Option<&FramedPacket> {
        match self {
            Packet::Initial(p) | Packet::Handshake(p) | Packet::ZeroRtt(p) | Packet::Short(p) => {
                Some(p)
            }
            _ => None,
        }
    }

    pub fn framed_mut(&mut self) -> Option<&mut FramedPacket> {
        match self {
            Packet::Initial(p) | Packet::Handshake(p) | Packet::ZeroRtt(p) | Packet::Short(p) => {
                Some(p)
            }
            _ => None,
        }
    }

    pub fn header(&self) -> Option<&Header> {
        self.framed().map(|p| &p.header)
    }

    pub fn packet_number(&self) -> Option<u64> {
        self.header().map(Header::packet_number)
    }

    /// 包头中的版本号（短包头与无状态重置没有版本）
    pub fn version(&self) -> Option<u32> {
        match self {
            Packet::Retry(p) => Some(p.version),
            Packet::VersionNegotiation(_) | Packet::StatelessReset(_) => None,
            _ => self.header().and_then(Header::version),
        }
    }

    pub fn frames(&self) -> &[Frame] {
        self.framed().map(|p| p.frames.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, frame_type: FrameType) -> bool {
        self.frames().iter().any(|f| f.frame_type() == frame_type)
    }

    pub fn should_be_acknowledged(&self) -> bool {
        self.frames().iter().any(Frame::is_ack_eliciting)
    }

    pub fn header_length(&self) -> usize {
        self.header().map(Header::length).unwrap_or(0)
    }

    /// 一行摘要，用于日志
    pub fn short_string(&self) -> String {
        match self.packet_number() {
            Some(pn) => format!("{{type={}, number={}}}", self.packet_type(), pn),
            None => format!("{{type={}}}", self.packet_type()),
        }
    }
}
