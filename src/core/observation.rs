//! 观察抽象：把一个查询符号期间收发的真实包折叠为抽象输出
//!
//! 规则：
//! - 入站包按包类型分类，帧种类去掉 PADDING；
//! - 重传的 CRYPTO / STREAM 数据在会话内只算一次，整包都是重传（或只剩 PADDING）时丢弃；
//! - 包号与版本只在查询符号指定了对应头部字段时才写入输出；
//! - 出站方向只保留最后一个发出的包，作为该位置的具体输入。

use std::collections::{BTreeMap, HashMap};

use crate::quic::{EncryptionLevel, Frame, FrameType, Packet};
use crate::symbols::{AbstractSet, AbstractSymbol, ConcreteSet, ConcreteSymbol, HeaderOptions};

/// 会话内已经收到过的字节区间（半开区间，按起点索引）
#[derive(Debug, Default, Clone)]
pub struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// `[start, end)` 是否已被完全覆盖
    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.ranges
            .range(..=start)
            .next_back()
            .map(|(_, &e)| e >= end)
            .unwrap_or(false)
    }

    /// 并入 `[start, end)`，合并相邻与重叠区间
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut lo = start;
        let mut hi = end;
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                lo = s;
                hi = hi.max(e);
            }
        }
        let absorbed: Vec<u64> = self.ranges.range(lo..=hi).map(|(&s, _)| s).collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                hi = hi.max(e);
            }
        }
        self.ranges.insert(lo, hi);
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DataKey {
    Crypto(EncryptionLevel),
    Stream(u64),
}

/// 一个查询符号的观察缓冲区，外加整个会话的重传过滤状态
#[derive(Debug, Default)]
pub struct Observation {
    request: Option<AbstractSymbol>,
    outputs: AbstractSet,
    received: ConcreteSet,
    sent: Option<ConcreteSymbol>,
    seen: HashMap<DataKey, RangeSet>,
}

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始处理新的查询符号：清空缓冲区（重传过滤状态保留）
    pub fn begin(&mut self, request: AbstractSymbol) {
        self.request = Some(request);
        self.outputs = AbstractSet::new();
        self.received = ConcreteSet::new();
        self.sent = None;
    }

    /// 连接重建后调用：新的连接从零开始计算重传
    pub fn reset_session(&mut self) {
        self.request = None;
        self.outputs = AbstractSet::new();
        self.received = ConcreteSet::new();
        self.sent = None;
        self.seen.clear();
    }

    /// 去掉已经见过的数据帧；返回是否是新数据
    fn is_fresh(&mut self, level: EncryptionLevel, frame: &Frame) -> bool {
        let (key, offset, len) = match frame {
            Frame::Crypto { offset, data } => (DataKey::Crypto(level), *offset, data.len() as u64),
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => (DataKey::Stream(*stream_id), *offset, data.len() as u64),
            _ => return true,
        };
        // 零长度的帧（比如只带 FIN 的 STREAM）不参与过滤
        if len == 0 {
            return true;
        }
        let end = offset.saturating_add(len);
        let seen = self.seen.entry(key).or_default();
        if seen.covers(offset, end) {
            return false;
        }
        seen.insert(offset, end);
        true
    }

    /// 处理一个入站包，返回它的抽象形式；被丢弃的包返回 None
    pub fn on_incoming(&mut self, packet: &Packet, connection_version: u32) -> Option<AbstractSymbol> {
        let mut packet = packet.clone();
        let level = packet.encryption_level();

        let mut version = match &packet {
            Packet::VersionNegotiation(_) => Some(0),
            Packet::Retry(_) | Packet::StatelessReset(_) => None,
            _ => Some(packet.version().unwrap_or(connection_version)),
        };

        if let Some(framed) = packet.framed_mut() {
            let frames = std::mem::take(&mut framed.frames);
            framed.frames = frames
                .into_iter()
                .filter(|f| self.is_fresh(level, f))
                .collect();
            if framed
                .frames
                .iter()
                .all(|f| f.frame_type() == FrameType::Padding)
            {
                tracing::debug!("Dropping {} without new frames", packet.short_string());
                return None;
            }
        }

        let frame_types = packet
            .frames()
            .iter()
            .map(Frame::frame_type)
            .filter(|t| *t != FrameType::Padding);

        let requested = self
            .request
            .as_ref()
            .map(|r| r.header_options)
            .unwrap_or_default();
        let packet_number = requested.packet_number.and(packet.packet_number());
        if requested.version.is_none() {
            version = None;
        }

        let symbol = AbstractSymbol::new(
            packet.packet_type(),
            HeaderOptions {
                packet_number,
                version,
            },
            frame_types,
        );
        tracing::debug!("Got response: {}", symbol);
        self.received.add(ConcreteSymbol::new(packet));
        self.outputs.add(symbol.clone());
        Some(symbol)
    }

    /// 记录一个出站包；只保留最后一个
    pub fn on_outgoing(&mut self, packet: &Packet) {
        self.sent = Some(ConcreteSymbol::new(packet.clone()));
    }

    /// 取出当前符号的观察结果：抽象输出、发出的包、收到的包
    pub fn capture(&mut self) -> (AbstractSet, Option<ConcreteSymbol>, ConcreteSet) {
        (
            std::mem::take(&mut self.outputs),
            self.sent.take(),
            std::mem::take(&mut self.received),
        )
    }
}
