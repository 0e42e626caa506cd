//! 包类型、加密级别与包号空间
//!
//! 三者之间的映射是固定的：每种包类型对应唯一的加密级别与包号空间。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 包类型（抽象符号中的 NAME 部分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PacketType {
    VersionNegotiation,
    Initial,
    Retry,
    Handshake,
    ZeroRtt,
    Short,
    StatelessReset,
}

impl PacketType {
    pub const ALL: [PacketType; 7] = [
        PacketType::VersionNegotiation,
        PacketType::Initial,
        PacketType::Retry,
        PacketType::Handshake,
        PacketType::ZeroRtt,
        PacketType::Short,
        PacketType::StatelessReset,
    ];

    /// 符号文本中使用的名字
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::VersionNegotiation => "VERNEG",
            PacketType::Initial => "INITIAL",
            PacketType::Retry => "RETRY",
            PacketType::Handshake => "HANDSHAKE",
            PacketType::ZeroRtt => "ZERO",
            PacketType::Short => "SHORT",
            PacketType::StatelessReset => "RESET",
        }
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        match self {
            PacketType::Initial => EncryptionLevel::Initial,
            PacketType::Handshake => EncryptionLevel::Handshake,
            PacketType::ZeroRtt => EncryptionLevel::ZeroRtt,
            PacketType::Short => EncryptionLevel::OneRtt,
            PacketType::VersionNegotiation | PacketType::Retry | PacketType::StatelessReset => {
                EncryptionLevel::None
            }
        }
    }

    pub fn pn_space(&self) -> PnSpace {
        match self {
            PacketType::Initial => PnSpace::Initial,
            PacketType::Handshake => PnSpace::Handshake,
            PacketType::ZeroRtt | PacketType::Short => PnSpace::AppData,
            PacketType::VersionNegotiation | PacketType::Retry | PacketType::StatelessReset => {
                PnSpace::NoSpace
            }
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PacketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PacketType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// 加密级别；Best / BestAppData 为虚拟级别，在发送时解析为具体级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EncryptionLevel {
    None,
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
    Best,
    BestAppData,
}

impl EncryptionLevel {
    pub fn is_virtual(&self) -> bool {
        matches!(self, EncryptionLevel::Best | EncryptionLevel::BestAppData)
    }

    pub fn pn_space(&self) -> PnSpace {
        match self {
            EncryptionLevel::Initial => PnSpace::Initial,
            EncryptionLevel::Handshake => PnSpace::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt | EncryptionLevel::BestAppData => {
                PnSpace::AppData
            }
            EncryptionLevel::None | EncryptionLevel::Best => PnSpace::NoSpace,
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncryptionLevel::None => "None",
            EncryptionLevel::Initial => "Initial",
            EncryptionLevel::ZeroRtt => "0-RTT",
            EncryptionLevel::Handshake => "Handshake",
            EncryptionLevel::OneRtt => "1-RTT",
            EncryptionLevel::Best => "Best",
            EncryptionLevel::BestAppData => "BestAppData",
        };
        f.write_str(s)
    }
}

/// 包号空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PnSpace {
    NoSpace,
    Initial,
    Handshake,
    AppData,
}

impl PnSpace {
    pub const ALL: [PnSpace; 4] = [
        PnSpace::NoSpace,
        PnSpace::Initial,
        PnSpace::Handshake,
        PnSpace::AppData,
    ];

    /// 用于在该空间发送 ACK 的加密级别
    pub fn encryption_level(&self) -> EncryptionLevel {
        match self {
            PnSpace::NoSpace => EncryptionLevel::None,
            PnSpace::Initial => EncryptionLevel::Initial,
            PnSpace::Handshake => EncryptionLevel::Handshake,
            PnSpace::AppData => EncryptionLevel::OneRtt,
        }
    }
}

/// 某一方向上某个加密级别的可用性变化（由引擎在密钥安装/丢弃时发布）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectionalEncryptionLevel {
    pub level: EncryptionLevel,
    /// true 为读方向，false 为写方向
    pub read: bool,
    pub available: bool,
}
