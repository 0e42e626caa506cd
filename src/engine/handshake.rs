//! 明文握手：用于模拟器目标与测试的握手协作者
//!
//! 握手消息以 JSON 行的形式放在 CRYPTO 流中：
//! 客户端 Initial 发 ClientHello；服务端 Initial 回 ServerHello（客户端安装 Handshake 密钥），
//! 服务端 Handshake 发 EncryptedExtensions（对端传输参数）与 Finished；
//! 客户端收到 Finished 后安装 1-RTT 密钥并在 Handshake 级别回 Finished。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Handshake, HandshakeEvent};
use crate::core::error::EngineError;
use crate::quic::{EncryptionLevel, TransportParameters};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum HandshakeMessage {
    ClientHello {
        server_name: String,
        params: TransportParameters,
    },
    ServerHello,
    EncryptedExtensions {
        params: TransportParameters,
    },
    Finished,
}

impl HandshakeMessage {
    /// 一行 JSON，换行结尾
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }

    /// 解析一段 CRYPTO 数据中的所有完整消息
    pub fn parse_all(data: &[u8]) -> Vec<HandshakeMessage> {
        data.split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_slice(line).ok())
            .collect()
    }
}

pub struct PlaintextHandshake {
    server_name: String,
    buffers: HashMap<EncryptionLevel, Vec<u8>>,
    complete: bool,
}

impl PlaintextHandshake {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            buffers: HashMap::new(),
            complete: false,
        }
    }

    fn handle(
        &mut self,
        level: EncryptionLevel,
        msg: HandshakeMessage,
    ) -> Result<Vec<HandshakeEvent>, EngineError> {
        match (level, msg) {
            (EncryptionLevel::Initial, HandshakeMessage::ServerHello) => {
                Ok(vec![HandshakeEvent::KeysReady(EncryptionLevel::Handshake)])
            }
            (EncryptionLevel::Handshake, HandshakeMessage::EncryptedExtensions { params }) => {
                Ok(vec![HandshakeEvent::PeerParameters(params)])
            }
            (EncryptionLevel::Handshake, HandshakeMessage::Finished) => {
                if self.complete {
                    return Ok(Vec::new());
                }
                self.complete = true;
                Ok(vec![
                    HandshakeEvent::KeysReady(EncryptionLevel::OneRtt),
                    HandshakeEvent::Data {
                        level: EncryptionLevel::Handshake,
                        data: HandshakeMessage::Finished.to_bytes(),
                    },
                    HandshakeEvent::Complete,
                ])
            }
            (level, msg) => Err(EngineError::Handshake(format!(
                "unexpected {:?} at {}",
                msg, level
            ))),
        }
    }
}

impl Handshake for PlaintextHandshake {
    fn start(&mut self, local_params: TransportParameters) -> Vec<HandshakeEvent> {
        self.buffers.clear();
        self.complete = false;
        let hello = HandshakeMessage::ClientHello {
            server_name: self.server_name.clone(),
            params: local_params,
        };
        vec![HandshakeEvent::Data {
            level: EncryptionLevel::Initial,
            data: hello.to_bytes(),
        }]
    }

    fn on_crypto_data(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
    ) -> Result<Vec<HandshakeEvent>, EngineError> {
        let buffer = self.buffers.entry(level).or_default();
        buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            lines.push(line);
        }

        let mut events = Vec::new();
        for line in lines {
            let msg: HandshakeMessage = serde_json::from_slice(&line[..line.len() - 1])
                .map_err(|e| EngineError::Handshake(e.to_string()))?;
            events.extend(self.handle(level, msg)?);
        }
        Ok(events)
    }
}
