//! 错误类型
//!
//! 按影响范围区分：查询级错误（本条查询回复 ERROR 或空观测）与实例级错误（持久化后终止进程）。

use std::path::PathBuf;

use thiserror::Error;

use crate::quic::EncryptionLevel;

/// 抽象符号文本解析失败；不会产生部分填充的值
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed symbol: {0}")]
    Malformed(String),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(String),

    #[error("Unknown frame kind: {0}")]
    UnknownFrameKind(String),

    #[error("Invalid header option '{value}' in {symbol}")]
    InvalidHeaderOption { symbol: String, value: String },
}

/// 引擎构造或 I/O 失败
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot resolve address: {0}")]
    Resolve(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Connection closed")]
    Closed,
}

/// Oracle 表与 trace 文件读写失败
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid glob pattern: {0}")]
    Pattern(String),
}

/// 对端违反我方流量控制限制（只记录，不中断）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowControlViolation {
    #[error("Stream {stream_id} is not permitted by the advertised stream limit")]
    StreamNotPermitted { stream_id: u64 },

    #[error("Stream {stream_id} data up to {end} exceeds its read limit {limit}")]
    StreamLimitExceeded { stream_id: u64, end: u64, limit: u64 },

    #[error("Connection data {consumed} exceeds MAX_DATA {limit}")]
    ConnectionLimitExceeded { consumed: u64, limit: u64 },

    #[error("MAX_STREAM_DATA for receive-only stream {stream_id}")]
    ReceiveOnlyStream { stream_id: u64 },
}

/// 适配器错误总表
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Encryption level {0} is unavailable")]
    UnavailableLevel(EncryptionLevel),

    #[error("Frame kind '{0}' cannot be injected")]
    UnsupportedFrameKind(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// 是否必须终止整个实例（其余错误只影响当前查询）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdapterError::UnsupportedFrameKind(_) | AdapterError::Engine(_)
        )
    }
}
