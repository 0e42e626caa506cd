//! HTTP Agent：在新的客户端双向流上发出 GET 请求并收集响应
//!
//! 请求的 STREAM 帧（带 FIN）保留在连接上，由编排器在注入 STREAM 时释放。
//! HTTP/3 只编码一个 HEADERS 帧（QPACK 静态表 + 字面值，不使用动态表），
//! 不建立控制流。

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::Instrument;

use super::flow_control::FlowControlAgent;
use super::{Agent, AgentBase};
use crate::quic::{lock, Connection, EncryptionLevel, Frame, QueuedFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    #[default]
    Http09,
    Http3,
}

/// HTTP/3 HEADERS 帧类型
const H3_HEADERS: u64 = 0x01;

// QPACK 静态表索引
const QPACK_AUTHORITY: u64 = 0;
const QPACK_PATH: u64 = 1;
const QPACK_METHOD_GET: u64 = 17;
const QPACK_SCHEME_HTTPS: u64 = 23;

/// QUIC 变长整数编码
pub fn encode_varint(v: u64, out: &mut Vec<u8>) {
    match v {
        0..=63 => out.push(v as u8),
        64..=16_383 => out.extend_from_slice(&((v as u16) | 0x4000).to_be_bytes()),
        16_384..=1_073_741_823 => out.extend_from_slice(&((v as u32) | 0x8000_0000).to_be_bytes()),
        _ => out.extend_from_slice(&(v | 0xc000_0000_0000_0000).to_be_bytes()),
    }
}

/// HPACK/QPACK 前缀整数编码；`flags` 是前缀之外的高位
fn encode_prefixed(v: u64, prefix_bits: u32, flags: u8, out: &mut Vec<u8>) {
    let max = (1u64 << prefix_bits) - 1;
    if v < max {
        out.push(flags | v as u8);
        return;
    }
    out.push(flags | max as u8);
    let mut rest = v - max;
    while rest >= 128 {
        out.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    out.push(rest as u8);
}

fn qpack_indexed(index: u64, out: &mut Vec<u8>) {
    // 11xxxxxx：静态表中的完整字段
    encode_prefixed(index, 6, 0xc0, out);
}

fn qpack_name_ref(index: u64, value: &str, out: &mut Vec<u8>) {
    // 0101xxxx：引用静态表名称 + 字面值（不使用 Huffman）
    encode_prefixed(index, 4, 0x50, out);
    encode_prefixed(value.len() as u64, 7, 0x00, out);
    out.extend_from_slice(value.as_bytes());
}

/// 编码请求体
pub fn encode_request(version: HttpVersion, path: &str, host: &str) -> Vec<u8> {
    match version {
        HttpVersion::Http09 => format!("GET {}\r\n", path).into_bytes(),
        HttpVersion::Http3 => {
            // 字段段前缀：Required Insert Count = 0，Base = 0
            let mut fields = vec![0x00, 0x00];
            qpack_indexed(QPACK_METHOD_GET, &mut fields);
            qpack_indexed(QPACK_SCHEME_HTTPS, &mut fields);
            qpack_name_ref(QPACK_AUTHORITY, host, &mut fields);
            qpack_name_ref(QPACK_PATH, path, &mut fields);

            let mut frame = Vec::new();
            encode_varint(H3_HEADERS, &mut frame);
            encode_varint(fields.len() as u64, &mut frame);
            frame.extend(fields);
            frame
        }
    }
}

pub struct HttpAgent {
    base: AgentBase,
    version: HttpVersion,
    flow_control: Arc<FlowControlAgent>,
    conn: std::sync::Mutex<Option<Arc<Connection>>>,
}

impl HttpAgent {
    pub fn new(version: HttpVersion, flow_control: Arc<FlowControlAgent>) -> Arc<Self> {
        Arc::new(Self {
            base: AgentBase::new("HttpAgent"),
            version,
            flow_control,
            conn: std::sync::Mutex::new(None),
        })
    }

    /// 在下一条客户端双向流上准备请求，返回流 ID；没有任何发送额度时返回 None
    pub async fn send_request(&self, path: &str, host: &str) -> Option<u64> {
        let conn = lock(&self.conn).clone()?;
        let body = encode_request(self.version, path, host);
        // 先拿到额度再占用流 ID，没有额度时下一次请求还用同一条流
        let stream_id = conn.next_bidi_stream();
        let granted = self
            .flow_control
            .reserve_at_most(stream_id, body.len() as u64)
            .await as usize;
        if granted == 0 {
            tracing::info!("No flow control credit for request on stream {}", stream_id);
            return None;
        }
        if !conn.claim_bidi_stream(stream_id) {
            tracing::warn!("Stream {} was opened concurrently, dropping request", stream_id);
            return None;
        }
        let fin = granted == body.len();
        if !fin {
            tracing::info!(
                "Insufficient credit on stream {}, holding {} of {} bytes",
                stream_id,
                granted,
                body.len()
            );
        }
        tracing::info!("Holding {:?} request for {} on stream {}", self.version, path, stream_id);
        conn.hold_frame(QueuedFrame::new(
            Frame::Stream {
                stream_id,
                offset: 0,
                data: body[..granted].to_vec(),
                fin,
            },
            EncryptionLevel::OneRtt,
        ));
        Some(stream_id)
    }
}

impl Agent for HttpAgent {
    fn base(&self) -> &AgentBase {
        &self.base
    }

    fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let mut ctx = self.base.init(&conn);
        let mut incoming = conn.incoming_packets.subscribe();
        *lock(&self.conn) = Some(conn);
        let span = ctx.span();

        tokio::spawn(
            async move {
                let mut responses: BTreeMap<u64, usize> = BTreeMap::new();
                loop {
                    tokio::select! {
                        biased;
                        _ = ctx.closing() => break,
                        Some(packet) = incoming.recv() => {
                            for frame in packet.frames() {
                                if let Frame::Stream { stream_id, data, fin, .. } = frame {
                                    let total = responses.entry(*stream_id).or_default();
                                    *total += data.len();
                                    if *fin {
                                        tracing::info!(
                                            "Received HTTP response on stream {}: {} bytes",
                                            stream_id,
                                            total
                                        );
                                    }
                                }
                            }
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
