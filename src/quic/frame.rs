//! 帧模型：封闭的帧种类枚举 + 帧内容
//!
//! 这里不关心比特级编码，只保留适配器需要的语义字段；`length()` 按 QUIC varint 规则估算
//! 编码长度，供发送 Agent 做 MTU 预算。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::EncryptionLevel;

/// 帧种类（抽象符号中的帧列表元素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FrameType {
    Padding,
    Ping,
    Ack,
    AckEcn,
    ResetStream,
    StopSending,
    Crypto,
    NewToken,
    Stream,
    MaxData,
    MaxStreamData,
    MaxStreams,
    DataBlocked,
    StreamDataBlocked,
    StreamsBlocked,
    NewConnectionId,
    RetireConnectionId,
    PathChallenge,
    PathResponse,
    ConnectionClose,
    ApplicationClose,
    HandshakeDone,
}

impl FrameType {
    pub const ALL: [FrameType; 22] = [
        FrameType::Padding,
        FrameType::Ping,
        FrameType::Ack,
        FrameType::AckEcn,
        FrameType::ResetStream,
        FrameType::StopSending,
        FrameType::Crypto,
        FrameType::NewToken,
        FrameType::Stream,
        FrameType::MaxData,
        FrameType::MaxStreamData,
        FrameType::MaxStreams,
        FrameType::DataBlocked,
        FrameType::StreamDataBlocked,
        FrameType::StreamsBlocked,
        FrameType::NewConnectionId,
        FrameType::RetireConnectionId,
        FrameType::PathChallenge,
        FrameType::PathResponse,
        FrameType::ConnectionClose,
        FrameType::ApplicationClose,
        FrameType::HandshakeDone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Padding => "PADDING",
            FrameType::Ping => "PING",
            FrameType::Ack => "ACK",
            FrameType::AckEcn => "ACK_ECN",
            FrameType::ResetStream => "RESET_STREAM",
            FrameType::StopSending => "STOP_SENDING",
            FrameType::Crypto => "CRYPTO",
            FrameType::NewToken => "NEW_TOKEN",
            FrameType::Stream => "STREAM",
            FrameType::MaxData => "MAX_DATA",
            FrameType::MaxStreamData => "MAX_STREAM_DATA",
            FrameType::MaxStreams => "MAX_STREAMS",
            FrameType::DataBlocked => "DATA_BLOCKED",
            FrameType::StreamDataBlocked => "STREAM_DATA_BLOCKED",
            FrameType::StreamsBlocked => "STREAMS_BLOCKED",
            FrameType::NewConnectionId => "NEW_CONNECTION_ID",
            FrameType::RetireConnectionId => "RETIRE_CONNECTION_ID",
            FrameType::PathChallenge => "PATH_CHALLENGE",
            FrameType::PathResponse => "PATH_RESPONSE",
            FrameType::ConnectionClose => "CONNECTION_CLOSE",
            FrameType::ApplicationClose => "APPLICATION_CLOSE",
            FrameType::HandshakeDone => "HANDSHAKE_DONE",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FrameType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// MAX_STREAMS / STREAMS_BLOCKED 的流方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamsType {
    Bidi,
    Uni,
}

/// ACK 区间（闭区间，按 largest 降序排列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AckRange {
    pub smallest: u64,
    pub largest: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// 帧内容；序列化时以 `type` 字段保留具体种类
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    Padding {
        length: usize,
    },
    Ping,
    Ack {
        ack_delay: u64,
        ranges: Vec<AckRange>,
        ecn: Option<EcnCounts>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
    NewToken {
        token: Vec<u8>,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        data: Vec<u8>,
        fin: bool,
    },
    MaxData {
        maximum_data: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum_stream_data: u64,
    },
    MaxStreams {
        streams_type: StreamsType,
        maximum_streams: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlocked {
        streams_type: StreamsType,
        limit: u64,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        connection_id: Vec<u8>,
        reset_token: Vec<u8>,
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    ConnectionClose {
        error_code: u64,
        frame_type: u64,
        reason: String,
    },
    ApplicationClose {
        error_code: u64,
        reason: String,
    },
    HandshakeDone,
}

/// QUIC 变长整数的编码字节数
pub fn varint_len(v: u64) -> usize {
    match v {
        0..=63 => 1,
        64..=16_383 => 2,
        16_384..=1_073_741_823 => 4,
        _ => 8,
    }
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding { .. } => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack { ecn: None, .. } => FrameType::Ack,
            Frame::Ack { ecn: Some(_), .. } => FrameType::AckEcn,
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::StopSending { .. } => FrameType::StopSending,
            Frame::Crypto { .. } => FrameType::Crypto,
            Frame::NewToken { .. } => FrameType::NewToken,
            Frame::Stream { .. } => FrameType::Stream,
            Frame::MaxData { .. } => FrameType::MaxData,
            Frame::MaxStreamData { .. } => FrameType::MaxStreamData,
            Frame::MaxStreams { .. } => FrameType::MaxStreams,
            Frame::DataBlocked { .. } => FrameType::DataBlocked,
            Frame::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Frame::StreamsBlocked { .. } => FrameType::StreamsBlocked,
            Frame::NewConnectionId { .. } => FrameType::NewConnectionId,
            Frame::RetireConnectionId { .. } => FrameType::RetireConnectionId,
            Frame::PathChallenge { .. } => FrameType::PathChallenge,
            Frame::PathResponse { .. } => FrameType::PathResponse,
            Frame::ConnectionClose { .. } => FrameType::ConnectionClose,
            Frame::ApplicationClose { .. } => FrameType::ApplicationClose,
            Frame::HandshakeDone => FrameType::HandshakeDone,
        }
    }

    /// 编码后的字节数（估算，不含包头）
    pub fn length(&self) -> usize {
        let v = varint_len;
        match self {
            Frame::Padding { length } => *length,
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack {
                ack_delay,
                ranges,
                ecn,
            } => {
                let mut len = 1 + v(*ack_delay) + v(ranges.len().saturating_sub(1) as u64);
                if let Some(first) = ranges.first() {
                    len += v(first.largest) + v(first.largest.saturating_sub(first.smallest));
                } else {
                    len += 2;
                }
                for pair in ranges.windows(2) {
                    let gap = pair[0].smallest.saturating_sub(pair[1].largest + 2);
                    len += v(gap) + v(pair[1].largest.saturating_sub(pair[1].smallest));
                }
                if let Some(e) = ecn {
                    len += v(e.ect0) + v(e.ect1) + v(e.ce);
                }
                len
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => 1 + v(*stream_id) + v(*error_code) + v(*final_size),
            Frame::StopSending {
                stream_id,
                error_code,
            } => 1 + v(*stream_id) + v(*error_code),
            Frame::Crypto { offset, data } => {
                1 + v(*offset) + v(data.len() as u64) + data.len()
            }
            Frame::NewToken { token } => 1 + v(token.len() as u64) + token.len(),
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                let offset_len = if *offset > 0 { v(*offset) } else { 0 };
                1 + v(*stream_id) + offset_len + v(data.len() as u64) + data.len()
            }
            Frame::MaxData { maximum_data } => 1 + v(*maximum_data),
            Frame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => 1 + v(*stream_id) + v(*maximum_stream_data),
            Frame::MaxStreams {
                maximum_streams, ..
            } => 1 + v(*maximum_streams),
            Frame::DataBlocked { limit } => 1 + v(*limit),
            Frame::StreamDataBlocked { stream_id, limit } => 1 + v(*stream_id) + v(*limit),
            Frame::StreamsBlocked { limit, .. } => 1 + v(*limit),
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                connection_id,
                reset_token,
            } => {
                1 + v(*sequence)
                    + v(*retire_prior_to)
                    + 1
                    + connection_id.len()
                    + reset_token.len()
            }
            Frame::RetireConnectionId { sequence } => 1 + v(*sequence),
            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 9,
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => 1 + v(*error_code) + v(*frame_type) + v(reason.len() as u64) + reason.len(),
            Frame::ApplicationClose { error_code, reason } => {
                1 + v(*error_code) + v(reason.len() as u64) + reason.len()
            }
        }
    }

    /// 是否为需要对端确认的帧
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. }
                | Frame::Ack { .. }
                | Frame::ConnectionClose { .. }
                | Frame::ApplicationClose { .. }
        )
    }
}

/// 排队等待发送的帧及其目标加密级别
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    pub frame: Frame,
    pub level: EncryptionLevel,
}

impl QueuedFrame {
    pub fn new(frame: Frame, level: EncryptionLevel) -> Self {
        Self { frame, level }
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame.frame_type()
    }

    pub fn request(&self) -> FrameRequest {
        FrameRequest::new(self.frame_type(), self.level)
    }
}

/// (帧种类, 加密级别) 二元组：保留帧队列的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRequest {
    pub frame_type: FrameType,
    pub level: EncryptionLevel,
}

impl FrameRequest {
    pub fn new(frame_type: FrameType, level: EncryptionLevel) -> Self {
        Self { frame_type, level }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_names_roundtrip() {
        for t in FrameType::ALL {
            assert_eq!(t.as_str().parse::<FrameType>().unwrap(), t);
        }
        assert_eq!("FOO".parse::<FrameType>(), Err("FOO".to_string()));
    }

    #[test]
    fn test_varint_len_boundaries() {
        assert_eq!(varint_len(63), 1);
        assert_eq!(varint_len(64), 2);
        assert_eq!(varint_len(16_383), 2);
        assert_eq!(varint_len(16_384), 4);
        assert_eq!(varint_len(1 << 30), 8);
    }

    #[test]
    fn test_frame_lengths() {
        assert_eq!(Frame::Ping.length(), 1);
        assert_eq!(Frame::Padding { length: 40 }.length(), 40);
        let crypto = Frame::Crypto {
            offset: 0,
            data: vec![0; 100],
        };
        assert_eq!(crypto.length(), 1 + 1 + 2 + 100);
        let stream = Frame::Stream {
            stream_id: 0,
            offset: 0,
            data: b"GET /\r\n".to_vec(),
            fin: true,
        };
        assert_eq!(stream.length(), 1 + 1 + 1 + 7);
    }

    #[test]
    fn test_ack_ecn_kind() {
        let ack = Frame::Ack {
            ack_delay: 0,
            ranges: vec![AckRange {
                smallest: 0,
                largest: 3,
            }],
            ecn: Some(EcnCounts {
                ect0: 1,
                ect1: 0,
                ce: 0,
            }),
        };
        assert_eq!(ack.frame_type(), FrameType::AckEcn);
        assert!(!ack.is_ack_eliciting());
    }

    #[test]
    fn test_frame_json_keeps_kind() {
        let frame = Frame::MaxStreamData {
            stream_id: 4,
            maximum_stream_data: 160,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"MaxStreamData\""));
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
