//! 关闭 Agent：空闲计时与关闭握手
//!
//! 状态 open → closing → terminal。空闲计时器在每个入站包和每个需要确认的出站包时重置；
//! 可以配置为在收到第一个入站包之前不因超时关闭。超时或显式关闭进入 closing，
//! 请求发出关闭帧，看到它离开时宣告连接关闭。对端发来关闭帧时直接宣告关闭；
//! 非重启的停止也直接宣告关闭。

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use super::{Agent, AgentBase, CloseMode};
use crate::quic::{lock, Connection, FrameType};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClosingSettings {
    pub wait_for_first_packet: bool,
}

pub struct ClosingAgent {
    base: AgentBase,
    settings: ClosingSettings,
    closing: AtomicBool,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl ClosingAgent {
    pub fn new(settings: ClosingSettings) -> Arc<Self> {
        Arc::new(Self {
            base: AgentBase::new("ClosingAgent"),
            settings,
            closing: AtomicBool::new(false),
            conn: Mutex::new(None),
        })
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// 进入 closing 并请求发出关闭帧；已在关闭中时不重复请求
    pub fn close(&self, quic_layer: bool, error_code: u64, reason: &str) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = lock(&self.conn).clone();
        if let Some(conn) = conn {
            tracing::info!("Closing connection: {}", reason);
            conn.close_connection(quic_layer, error_code, reason);
        }
    }
}

impl Agent for ClosingAgent {
    fn base(&self) -> &AgentBase {
        &self.base
    }

    fn run(self: Arc<Self>, conn: Arc<Connection>) {
        let mut ctx = self.base.init(&conn);
        let mut incoming = conn.incoming_packets.subscribe();
        let mut outgoing = conn.outgoing_packets.subscribe();
        *lock(&self.conn) = Some(conn.clone());
        let idle = Duration::from_millis(conn.local_params().idle_timeout);
        let span = ctx.span();
        let agent = self.clone();

        tokio::spawn(
            async move {
                let timer = tokio::time::sleep(idle);
                tokio::pin!(timer);
                let mut armed = true;
                let mut received_first = false;

                loop {
                    tokio::select! {
                        biased;
                        mode = ctx.closing() => {
                            if mode == CloseMode::Stop {
                                conn.close();
                            }
                            break;
                        }
                        Some(packet) = incoming.recv() => {
                            if packet.contains(FrameType::ConnectionClose)
                                || packet.contains(FrameType::ApplicationClose)
                            {
                                tracing::info!("Peer closed the connection");
                                agent.closing.store(true, Ordering::SeqCst);
                                conn.close();
                                break;
                            }
                            received_first = true;
                            timer.as_mut().reset(Instant::now() + idle);
                            armed = true;
                        }
                        Some(packet) = outgoing.recv() => {
                            if agent.is_closing()
                                && (packet.contains(FrameType::ConnectionClose)
                                    || packet.contains(FrameType::ApplicationClose))
                            {
                                conn.close();
                                break;
                            }
                            if packet.should_be_acknowledged() {
                                timer.as_mut().reset(Instant::now() + idle);
                                armed = true;
                            }
                        }
                        _ = &mut timer, if armed => {
                            armed = false;
                            if agent.settings.wait_for_first_packet && !received_first {
                                tracing::debug!("Idle timeout reached before the first packet, ignoring");
                                continue;
                            }
                            tracing::info!("Idle timeout of {:?} reached", idle);
                            agent.close(true, 0, "Idle timeout");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::connection::tests::test_connection;
    use crate::quic::{EncryptionLevel, Frame, FramedPacket, Header, Packet, ShortHeader};

    fn ping() -> Packet {
        let mut p = FramedPacket::new(Header::Short(ShortHeader {
            destination_cid: vec![],
            key_phase: false,
            packet_number: 0,
        }));
        p.frames.push(Frame::Ping);
        Packet::Short(p)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_requests_close_frame() {
        let (conn, _) = test_connection();
        let agent = ClosingAgent::new(ClosingSettings::default());
        agent.clone().run(conn.clone());
        let mut queued = conn.frame_queue.subscribe();

        tokio::time::sleep(Duration::from_millis(30_001)).await;
        assert!(agent.is_closing());
        let close = queued.recv().await.unwrap();
        assert_eq!(close.frame.frame_type(), FrameType::ConnectionClose);
        assert_eq!(close.level, EncryptionLevel::Best);
        assert!(!conn.is_closed());

        // 关闭帧离开后宣告关闭
        let mut packet = conn.new_packet(EncryptionLevel::Initial).unwrap();
        packet.framed_mut().unwrap().frames.push(close.frame);
        conn.send_packet(packet).unwrap();
        tokio::time::timeout(Duration::from_secs(1), conn.closed().cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_declares_closed() {
        let (conn, _) = test_connection();
        let agent = ClosingAgent::new(ClosingSettings {
            wait_for_first_packet: true,
        });
        agent.clone().run(conn.clone());

        conn.receive(ping());
        assert!(!conn.is_closed());

        let mut close = FramedPacket::new(Header::Short(ShortHeader {
            destination_cid: vec![],
            key_phase: false,
            packet_number: 1,
        }));
        close.frames.push(Frame::ApplicationClose {
            error_code: 0,
            reason: "bye".into(),
        });
        conn.receive(Packet::Short(close));
        tokio::time::timeout(Duration::from_secs(1), conn.closed().cancelled())
            .await
            .unwrap();
        assert!(agent.is_closing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_first_packet() {
        let (conn, _) = test_connection();
        let agent = ClosingAgent::new(ClosingSettings {
            wait_for_first_packet: true,
        });
        agent.clone().run(conn.clone());

        tokio::time::sleep(Duration::from_millis(60_000)).await;
        assert!(!agent.is_closing());

        conn.receive(ping());
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert!(!agent.is_closing());
        tokio::time::sleep(Duration::from_millis(20_001)).await;
        assert!(agent.is_closing());
    }

    #[tokio::test]
    async fn test_stop_declares_closed_but_restart_does_not() {
        let (conn, _) = test_connection();
        let agent = ClosingAgent::new(ClosingSettings::default());
        agent.clone().run(conn.clone());
        agent.restart();
        agent.join().await;
        assert!(!conn.is_closed());

        agent.clone().run(conn.clone());
        agent.stop();
        agent.join().await;
        assert!(conn.is_closed());
    }
}
