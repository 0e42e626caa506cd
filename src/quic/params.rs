//! 传输参数与流 ID 规则

use serde::{Deserialize, Serialize};

/// 与流量控制、空闲超时相关的传输参数子集
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportParameters {
    pub max_data: u64,
    pub max_stream_data_bidi_local: u64,
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
    pub max_bidi_streams: u64,
    pub max_uni_streams: u64,
    /// 毫秒
    pub idle_timeout: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            max_data: 16_384,
            max_stream_data_bidi_local: 16_384,
            max_stream_data_bidi_remote: 16_384,
            max_stream_data_uni: 16_384,
            max_bidi_streams: 1,
            max_uni_streams: 3,
            idle_timeout: 30_000,
        }
    }
}

// 流 ID 低两位：bit0 = 发起方（0 客户端 / 1 服务端），bit1 = 方向（0 双向 / 1 单向）

pub fn is_bidi_client(stream_id: u64) -> bool {
    stream_id & 0x3 == 0
}

pub fn is_bidi_server(stream_id: u64) -> bool {
    stream_id & 0x3 == 1
}

pub fn is_uni_client(stream_id: u64) -> bool {
    stream_id & 0x3 == 2
}

pub fn is_uni_server(stream_id: u64) -> bool {
    stream_id & 0x3 == 3
}

pub fn is_uni(stream_id: u64) -> bool {
    stream_id & 0x2 != 0
}

/// 在 `count` 个流的额度下，某一类流允许的最大流 ID；额度为 0 时返回 None
fn max_stream_id(count: u64, kind_bits: u64) -> Option<u64> {
    count.checked_sub(1).map(|n| n * 4 + kind_bits)
}

pub fn max_bidi_client(count: u64) -> Option<u64> {
    max_stream_id(count, 0)
}

pub fn max_bidi_server(count: u64) -> Option<u64> {
    max_stream_id(count, 1)
}

pub fn max_uni_client(count: u64) -> Option<u64> {
    max_stream_id(count, 2)
}

pub fn max_uni_server(count: u64) -> Option<u64> {
    max_stream_id(count, 3)
}
