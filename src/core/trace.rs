//! 包级 trace：开启 `tracing` 配置时记录每个收发的包，STOP 时写入 `trace-<unix>.json`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::core::error::PersistenceError;
use crate::quic::{lock, Connection, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Unix 毫秒时间戳
    pub timestamp_ms: i64,
    pub direction: Direction,
    pub packet: Packet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Unix 秒
    pub started_at: i64,
    pub sut_address: String,
    pub events: Vec<TraceEvent>,
    pub results: BTreeMap<String, String>,
}

impl Trace {
    pub fn new(sut_address: impl Into<String>) -> Self {
        Self {
            started_at: chrono::Utc::now().timestamp(),
            sut_address: sut_address.into(),
            ..Self::default()
        }
    }

    fn push(&mut self, direction: Direction, packet: Packet) {
        self.events.push(TraceEvent {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            direction,
            packet,
        });
    }
}

/// 跨重置累积同一份 Trace；每次重建连接后重新挂接
pub struct TraceRecorder {
    trace: Arc<Mutex<Trace>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TraceRecorder {
    pub fn new(sut_address: impl Into<String>) -> Self {
        Self {
            trace: Arc::new(Mutex::new(Trace::new(sut_address))),
            task: Mutex::new(None),
        }
    }

    /// 订阅连接的收发包；之前挂接的连接不再记录
    pub fn attach(&self, conn: &Arc<Connection>) {
        let mut incoming = conn.incoming_packets.subscribe();
        let mut outgoing = conn.outgoing_packets.subscribe();
        let closed = conn.closed().clone();
        let trace = self.trace.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    Some(packet) = incoming.recv() => lock(&trace).push(Direction::Incoming, packet),
                    Some(packet) = outgoing.recv() => lock(&trace).push(Direction::Outgoing, packet),
                    _ = closed.cancelled() => break,
                    else => break,
                }
            }
        });
        if let Some(previous) = lock(&self.task).replace(handle) {
            previous.abort();
        }
    }

    pub fn record_result(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.trace).results.insert(key.into(), value.into());
    }

    pub fn snapshot(&self) -> Trace {
        lock(&self.trace).clone()
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        let content = {
            let trace = lock(&self.trace);
            serde_json::to_string(&*trace).map_err(|source| PersistenceError::Json {
                path: path.to_path_buf(),
                source,
            })?
        };
        std::fs::write(path, content).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Saved trace to {}", path.display());
        Ok(())
    }
}

impl Drop for TraceRecorder {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::connection::tests::test_connection;
    use crate::quic::{EncryptionLevel, Frame};
    use std::time::Duration;

    #[tokio::test]
    async fn test_records_both_directions_and_saves() {
        let (conn, _) = test_connection();
        let recorder = TraceRecorder::new("127.0.0.1:4433");
        recorder.attach(&conn);

        let mut packet = conn.new_packet(EncryptionLevel::Initial).unwrap();
        packet.framed_mut().unwrap().frames.push(Frame::Ping);
        conn.send_packet(packet.clone()).unwrap();
        conn.receive(packet);
        tokio::time::sleep(Duration::from_millis(50)).await;

        recorder.record_result("queries", "1");
        let trace = recorder.snapshot();
        assert_eq!(trace.events.len(), 2);
        assert!(trace.events.iter().any(|e| e.direction == Direction::Incoming));
        assert!(trace.events.iter().any(|e| e.direction == Direction::Outgoing));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace-1.json");
        recorder.save_to(&path).unwrap();
        let loaded: Trace =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, trace);
        assert_eq!(loaded.sut_address, "127.0.0.1:4433");
    }

    #[tokio::test]
    async fn test_reattach_follows_new_connection() {
        let (old, _) = test_connection();
        let (new, _) = test_connection();
        let recorder = TraceRecorder::new("sut");
        recorder.attach(&old);
        recorder.attach(&new);

        let mut packet = new.new_packet(EncryptionLevel::Initial).unwrap();
        packet.framed_mut().unwrap().frames.push(Frame::Ping);
        old.receive(packet.clone());
        new.receive(packet);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.snapshot().events.len(), 1);
    }
}
