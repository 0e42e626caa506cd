//! 适配器端到端场景：内存引擎 + 脚本化对端

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use quic_adapter::core::{Adapter, AdapterError, AdapterSettings, ShutdownManager, ShutdownReason};
    use quic_adapter::engine::{HandshakeMessage, MemoryEngineFactory, Peer};
    use quic_adapter::quic::{
        AckRange, Frame, FramedPacket, Header, LongHeader, Packet, PacketType, RetryPacket,
        ShortHeader, TransportParameters,
    };
    use quic_adapter::server;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    const SERVER_CID: [u8; 8] = [5; 8];

    /// 确认每个客户端包；收到 ClientHello 时回完整的服务端握手飞行，
    /// 可以配置为先要求一次 Retry
    struct ScriptedPeer {
        require_retry: bool,
        next_pn: HashMap<PacketType, u64>,
    }

    impl ScriptedPeer {
        fn new(require_retry: bool) -> Self {
            Self {
                require_retry,
                next_pn: HashMap::new(),
            }
        }

        fn packet(&mut self, packet_type: PacketType, frames: Vec<Frame>) -> Packet {
            let pn = self.next_pn.entry(packet_type).or_insert(0);
            let packet_number = *pn;
            *pn += 1;
            let long = |packet_number| {
                Header::Long(LongHeader {
                    version: 1,
                    destination_cid: vec![],
                    source_cid: SERVER_CID.to_vec(),
                    token: vec![],
                    packet_number,
                })
            };
            let mut framed = match packet_type {
                PacketType::Initial | PacketType::Handshake => FramedPacket::new(long(packet_number)),
                _ => FramedPacket::new(Header::Short(ShortHeader {
                    destination_cid: vec![],
                    key_phase: false,
                    packet_number,
                })),
            };
            framed.frames = frames;
            match packet_type {
                PacketType::Initial => Packet::Initial(framed),
                PacketType::Handshake => Packet::Handshake(framed),
                _ => Packet::Short(framed),
            }
        }

        fn ack(pn: u64) -> Frame {
            Frame::Ack {
                ack_delay: 0,
                ranges: vec![AckRange {
                    smallest: pn,
                    largest: pn,
                }],
                ecn: None,
            }
        }
    }

    fn carries_client_hello(packet: &Packet) -> bool {
        packet.frames().iter().any(|f| match f {
            Frame::Crypto { data, .. } => HandshakeMessage::parse_all(data)
                .iter()
                .any(|m| matches!(m, HandshakeMessage::ClientHello { .. })),
            _ => false,
        })
    }

    impl Peer for ScriptedPeer {
        fn on_datagram(&mut self, packets: &[Packet]) -> Vec<Packet> {
            let mut replies = Vec::new();
            for packet in packets {
                let (Some(framed), Some(pn)) = (packet.framed(), packet.packet_number()) else {
                    continue;
                };
                let token_present = match &framed.header {
                    Header::Long(h) => !h.token.is_empty(),
                    Header::Short(_) => false,
                };

                if packet.packet_type() == PacketType::Initial && carries_client_hello(packet) {
                    if self.require_retry && !token_present {
                        replies.push(Packet::Retry(RetryPacket {
                            version: 1,
                            destination_cid: vec![],
                            source_cid: vec![9; 8],
                            token: vec![7; 4],
                            integrity_tag: vec![0; 16],
                        }));
                        continue;
                    }
                    let server_hello = Frame::Crypto {
                        offset: 0,
                        data: HandshakeMessage::ServerHello.to_bytes(),
                    };
                    let initial = self.packet(PacketType::Initial, vec![Self::ack(pn), server_hello]);
                    let mut flight = HandshakeMessage::EncryptedExtensions {
                        params: TransportParameters {
                            max_bidi_streams: 4,
                            ..TransportParameters::default()
                        },
                    }
                    .to_bytes();
                    flight.extend(HandshakeMessage::Finished.to_bytes());
                    let handshake = self.packet(
                        PacketType::Handshake,
                        vec![Frame::Crypto {
                            offset: 0,
                            data: flight,
                        }],
                    );
                    replies.push(initial);
                    replies.push(handshake);
                    continue;
                }

                let reply_type = match packet.packet_type() {
                    PacketType::Initial => PacketType::Initial,
                    PacketType::Handshake => PacketType::Handshake,
                    _ => PacketType::Short,
                };
                let reply = self.packet(reply_type, vec![Self::ack(pn)]);
                replies.push(reply);
            }
            replies
        }
    }

    fn settings(output_dir: &Path, wait_ms: u64) -> AdapterSettings {
        AdapterSettings {
            wait_time: Duration::from_millis(wait_ms),
            retry_wait: Duration::from_millis(400),
            output_dir: output_dir.to_path_buf(),
            table_path: None,
            ..AdapterSettings::default()
        }
    }

    fn factory(require_retry: bool) -> Arc<MemoryEngineFactory> {
        Arc::new(MemoryEngineFactory::new(
            "quic.example",
            TransportParameters::default(),
            move || Box::new(ScriptedPeer::new(require_retry)),
        ))
    }

    #[tokio::test]
    async fn test_handshake_query_is_answered_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = Adapter::new(settings(dir.path(), 100), factory(false))
            .await
            .unwrap();

        let reply = adapter
            .handle_query("INITIAL(?,?)[CRYPTO] INITIAL(?,?)[ACK,CRYPTO]")
            .await
            .unwrap();
        let outputs: Vec<&str> = reply.split(' ').collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0], "{HANDSHAKE(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]}");
        assert_eq!(outputs[1], "{INITIAL(?,?)[ACK]}");

        assert_eq!(adapter.table().len(), 1);
        let (key, evidence) = adapter.table().iter().next().unwrap();
        assert_eq!(
            key.as_str(),
            "([INITIAL(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]],[{HANDSHAKE(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]},{INITIAL(?,?)[ACK]}])"
        );
        assert_eq!(evidence.inputs.len(), 2);
        let first = evidence.inputs[0].as_ref().unwrap();
        assert_eq!(first.packet().packet_type(), PacketType::Initial);
        let second = evidence.inputs[1].as_ref().unwrap();
        assert!(matches!(
            second.packet().packet_type(),
            PacketType::Initial | PacketType::Handshake
        ));
        assert_eq!(evidence.outputs[0].len(), 2);

        adapter.stop().await;
        assert!(dir.path().join("oracleTable.json").exists());
    }

    #[tokio::test]
    async fn test_unavailable_level_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = Adapter::new(settings(dir.path(), 50), factory(false))
            .await
            .unwrap();
        let reply = adapter.handle_query("SHORT(?,?)[PING]").await.unwrap();
        assert_eq!(reply, "{}");
        assert_eq!(adapter.table().len(), 1);
        adapter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_extends_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = Adapter::new(settings(dir.path(), 100), factory(true))
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let reply = adapter
            .handle_query("INITIAL(?,?)[CRYPTO] INITIAL(?,?)[CRYPTO]")
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100 + 400 + 100));

        let outputs: Vec<&str> = reply.split(' ').collect();
        assert_eq!(outputs[0], "{RETRY(?,?)[]}");
        assert_eq!(outputs[1], "{HANDSHAKE(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]}");
        assert_eq!(adapter.connection().dcid(), vec![9; 8]);
        adapter.stop().await;
    }

    #[tokio::test]
    async fn test_reset_rebuilds_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter = Adapter::new(settings(dir.path(), 50), factory(false))
            .await
            .unwrap();
        let before = adapter.connection().odcid_hex();
        adapter.handle_query("INITIAL(?,?)[CRYPTO]").await.unwrap();
        adapter.reset().await.unwrap();
        assert_ne!(adapter.connection().odcid_hex(), before);
        assert_eq!(adapter.status().resets, 1);

        // 新连接上同样的查询得到同样的结果
        let reply = adapter.handle_query("INITIAL(?,?)[CRYPTO]").await.unwrap();
        assert_eq!(reply, "{HANDSHAKE(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]}");
        assert_eq!(adapter.table().len(), 1);
        adapter.stop().await;
    }

    async fn read_line(lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_line_protocol_and_fatal_unknown_frame_kind() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Adapter::new(settings(dir.path(), 50), factory(false))
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(ShutdownManager::new());
        let serving = tokio::spawn(server::serve(listener, adapter, shutdown.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"START\nRESET\n").await.unwrap();
        assert_eq!(read_line(&mut lines).await.as_deref(), Some("DONE"));

        writer.write_all(b"not-a-symbol\n").await.unwrap();
        assert_eq!(read_line(&mut lines).await.as_deref(), Some("ERROR"));

        writer.write_all(b"INITIAL(?,?)[CRYPTO]\n").await.unwrap();
        assert_eq!(
            read_line(&mut lines).await.as_deref(),
            Some("{HANDSHAKE(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]}")
        );

        writer.write_all(b"INITIAL(?,?)[FOO]\n").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AdapterError::UnsupportedFrameKind(ref k)) if k == "FOO"));
        assert!(matches!(shutdown.reason(), Some(ShutdownReason::FatalError(_))));
        assert!(shutdown.reason().is_some_and(|r| r.is_failure()));
        assert_eq!(read_line(&mut lines).await, None);

        // 终止前已经持久化
        let tables: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("oracleTable"))
            .collect();
        assert!(tables.iter().any(|n| n == "oracleTable.json"));
        assert!(tables.len() >= 2);
    }

    #[tokio::test]
    async fn test_stop_command_persists_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Adapter::new(settings(dir.path(), 50), factory(false))
            .await
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(ShutdownManager::new());
        let serving = tokio::spawn(server::serve(listener, adapter, shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"STOP\n").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::LearnerStop));
        assert!(!ShutdownReason::LearnerStop.is_failure());
        assert!(dir.path().join("oracleTable.json").exists());
    }
}
