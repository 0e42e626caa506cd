//! 内存引擎：进程内的对端模型，用于测试
//!
//! 发出的数据报经 mpsc 送到驱动任务，由 `Peer` 产生回应，再经 `Connection::receive` 交付，
//! 与真实网络一样是异步到达的。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{estimated_len, Engine, EngineFactory, PlaintextHandshake, Transport};
use crate::core::error::EngineError;
use crate::quic::{Connection, EncryptionLevel, Packet, TransportParameters};

/// 对端模型：收到一个数据报，返回要回送的包
pub trait Peer: Send + 'static {
    fn on_datagram(&mut self, packets: &[Packet]) -> Vec<Packet>;
}

struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<Packet>>,
}

impl Transport for MemoryTransport {
    fn encoded_len(&self, packet: &Packet, level: EncryptionLevel) -> usize {
        estimated_len(packet, level)
    }

    fn send_datagram(&self, packets: &[Packet]) -> Result<(), EngineError> {
        self.tx
            .send(packets.to_vec())
            .map_err(|_| EngineError::Closed)
    }
}

type PeerBuilder = dyn Fn() -> Box<dyn Peer> + Send + Sync;

/// 每次 connect 都用 `make_peer` 构造一个全新的对端
pub struct MemoryEngineFactory {
    server_name: String,
    local_params: TransportParameters,
    make_peer: Arc<PeerBuilder>,
}

impl MemoryEngineFactory {
    pub fn new(
        server_name: &str,
        local_params: TransportParameters,
        make_peer: impl Fn() -> Box<dyn Peer> + Send + Sync + 'static,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            local_params,
            make_peer: Arc::new(make_peer),
        }
    }
}

#[async_trait]
impl EngineFactory for MemoryEngineFactory {
    async fn connect(&self) -> Result<Engine, EngineError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Packet>>();
        let connection = Connection::new(
            Arc::new(MemoryTransport { tx }),
            &self.server_name,
            false,
            self.local_params,
        );

        let mut peer = (self.make_peer)();
        let conn = connection.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn.closed().cancelled() => break,
                    Some(datagram) = rx.recv() => {
                        for reply in peer.on_datagram(&datagram) {
                            conn.receive(reply);
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(Engine {
            connection,
            handshake: Box::new(PlaintextHandshake::new(&self.server_name)),
        })
    }
}
