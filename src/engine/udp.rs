//! UDP 引擎：tokio `UdpSocket` + 可替换的包编解码器

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{estimated_len, Engine, EngineFactory, EngineSettings, PlaintextHandshake, Transport};
use crate::core::error::EngineError;
use crate::quic::{Connection, EncryptionLevel, Packet};

/// 最大接收数据报
const MAX_DATAGRAM: usize = 65_535;

/// 比特级包编解码（外部协作者）
pub trait PacketCodec: Send + Sync {
    fn encode(&self, packets: &[Packet]) -> Result<Vec<u8>, EngineError>;
    fn decode(&self, datagram: &[u8]) -> Result<Vec<Packet>, EngineError>;
    fn encoded_len(&self, packet: &Packet, level: EncryptionLevel) -> usize;
}

/// 每个数据报是一个 JSON 包数组；供模拟器目标使用
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl PacketCodec for JsonCodec {
    fn encode(&self, packets: &[Packet]) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(packets).map_err(|e| EngineError::Codec(e.to_string()))
    }

    fn decode(&self, datagram: &[u8]) -> Result<Vec<Packet>, EngineError> {
        serde_json::from_slice(datagram).map_err(|e| EngineError::Codec(e.to_string()))
    }

    fn encoded_len(&self, packet: &Packet, level: EncryptionLevel) -> usize {
        estimated_len(packet, level)
    }
}

struct UdpTransport {
    socket: Arc<UdpSocket>,
    codec: Arc<dyn PacketCodec>,
}

impl Transport for UdpTransport {
    fn encoded_len(&self, packet: &Packet, level: EncryptionLevel) -> usize {
        self.codec.encoded_len(packet, level)
    }

    fn send_datagram(&self, packets: &[Packet]) -> Result<(), EngineError> {
        let bytes = self.codec.encode(packets)?;
        self.socket.try_send(&bytes)?;
        Ok(())
    }
}

pub struct UdpEngineFactory {
    settings: EngineSettings,
    codec: Arc<dyn PacketCodec>,
}

impl UdpEngineFactory {
    pub fn new(settings: EngineSettings, codec: Arc<dyn PacketCodec>) -> Self {
        Self { settings, codec }
    }
}

#[async_trait]
impl EngineFactory for UdpEngineFactory {
    async fn connect(&self) -> Result<Engine, EngineError> {
        let addr = tokio::net::lookup_host(&self.settings.sul_address)
            .await?
            .next()
            .ok_or_else(|| EngineError::Resolve(self.settings.sul_address.clone()))?;
        let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        socket.connect(addr).await?;
        tracing::info!("Connected UDP socket {} -> {}", socket.local_addr()?, addr);

        let transport = Arc::new(UdpTransport {
            socket: socket.clone(),
            codec: self.codec.clone(),
        });
        let connection = Connection::new(
            transport,
            &self.settings.server_name,
            addr.is_ipv6(),
            self.settings.local_params,
        );

        let conn = connection.clone();
        let codec = self.codec.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = conn.closed().cancelled() => break,
                    r = socket.recv(&mut buf) => match r {
                        Ok(n) => match codec.decode(&buf[..n]) {
                            Ok(packets) => {
                                for packet in packets {
                                    conn.receive(packet);
                                }
                            }
                            Err(e) => tracing::debug!("Dropping undecodable datagram: {}", e),
                        },
                        Err(e) => {
                            tracing::warn!("UDP receive failed: {}", e);
                            break;
                        }
                    },
                }
            }
            tracing::debug!("UDP reader for {} terminated", conn.odcid_hex());
        });

        let handshake = Box::new(PlaintextHandshake::new(&self.settings.server_name));
        Ok(Engine {
            connection,
            handshake,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::{Frame, TransportParameters};

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec;
        let retry = Packet::StatelessReset(crate::quic::StatelessResetPacket {
            reset_token: vec![1; 16],
        });
        let bytes = codec.encode(std::slice::from_ref(&retry)).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), vec![retry]);
        assert!(codec.decode(b"nope").is_err());
    }

    #[tokio::test]
    async fn test_udp_engine_delivers_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let settings = EngineSettings {
            sul_address: peer.local_addr().unwrap().to_string(),
            server_name: "quic.example".into(),
            local_params: TransportParameters::default(),
        };
        let engine = UdpEngineFactory::new(settings, Arc::new(JsonCodec))
            .connect()
            .await
            .unwrap();
        let conn = engine.connection.clone();
        let mut incoming = conn.incoming_packets.subscribe();

        let mut packet = conn.new_packet(EncryptionLevel::Initial).unwrap();
        packet.framed_mut().unwrap().frames.push(Frame::Ping);
        conn.send_packet(packet.clone()).unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(JsonCodec.decode(&buf[..n]).unwrap(), vec![packet.clone()]);

        peer.send_to(&buf[..n], from).await.unwrap();
        assert_eq!(incoming.recv().await, Some(packet));
        conn.close();
    }
}
