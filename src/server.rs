//! 面向学习器的行协议服务器
//!
//! 每行一条命令：`START`（无回复）、`RESET`（回复 `DONE`）、`STOP`（持久化后退出），
//! 其余都是查询，回复空格分隔的输出集合编码。查询级错误回复 `ERROR`，实例级错误
//! 先持久化再返回错误。同一时间只服务一个学习器连接，查询严格串行。

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::core::error::AdapterError;
use crate::core::orchestrator::Adapter;
use crate::core::shutdown::{ShutdownManager, ShutdownReason};

/// 控制通道上的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Reset,
    Stop,
    Query(String),
}

impl ControlCommand {
    /// 去掉行尾的 `\r\n`；空行返回 None
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']).trim();
        match line {
            "" => None,
            "START" => Some(ControlCommand::Start),
            "RESET" => Some(ControlCommand::Reset),
            "STOP" => Some(ControlCommand::Stop),
            query => Some(ControlCommand::Query(query.to_string())),
        }
    }
}

/// 一个学习器连接结束的原因
enum ClientExit {
    Disconnected,
    Stopped,
}

/// 接受学习器连接直到 STOP、关闭信号或实例级错误
pub async fn serve(
    listener: TcpListener,
    mut adapter: Adapter,
    shutdown: Arc<ShutdownManager>,
) -> Result<(), AdapterError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Adapter listening on {}", addr);
    }

    loop {
        let stream = tokio::select! {
            _ = shutdown.wait_for_shutdown() => {
                tracing::info!("Shutdown requested, persisting results");
                adapter.stop().await;
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::info!("Learner connected from {}", addr);
                    stream
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        match handle_client(stream, &mut adapter, &shutdown).await {
            Ok(ClientExit::Stopped) => return Ok(()),
            Ok(ClientExit::Disconnected) => tracing::info!("Learner disconnected"),
            Err(e) => return Err(e),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    adapter: &mut Adapter,
    shutdown: &ShutdownManager,
) -> Result<ClientExit, AdapterError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => {
                tracing::info!("Shutdown requested, persisting results");
                adapter.stop().await;
                return Ok(ClientExit::Stopped);
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(ClientExit::Disconnected);
        };
        let Some(command) = ControlCommand::parse(&line) else {
            continue;
        };
        tracing::info!("Server input: {:?}", command);

        let reply = match command {
            ControlCommand::Start => {
                adapter.start();
                None
            }
            ControlCommand::Reset => match adapter.reset().await {
                Ok(()) => Some("DONE".to_string()),
                Err(e) => return fail(adapter, shutdown, e).await,
            },
            ControlCommand::Stop => {
                adapter.stop().await;
                shutdown.shutdown(ShutdownReason::LearnerStop);
                let _ = writer.shutdown().await;
                return Ok(ClientExit::Stopped);
            }
            ControlCommand::Query(query) => match adapter.handle_query(&query).await {
                Ok(outputs) => Some(outputs),
                Err(e) if e.is_fatal() => return fail(adapter, shutdown, e).await,
                Err(e) => {
                    tracing::warn!("Query '{}' failed: {}", query, e);
                    Some("ERROR".to_string())
                }
            },
        };

        if let Some(mut reply) = reply {
            reply.push('\n');
            if let Err(e) = writer.write_all(reply.as_bytes()).await {
                tracing::warn!("Failed to reply to learner: {}", e);
                return Ok(ClientExit::Disconnected);
            }
        }
    }
}

/// 实例级错误：持久化已有结果后终止
async fn fail(
    adapter: &mut Adapter,
    shutdown: &ShutdownManager,
    error: AdapterError,
) -> Result<ClientExit, AdapterError> {
    tracing::error!("Fatal adapter error: {}", error);
    adapter.stop().await;
    shutdown.shutdown(ShutdownReason::FatalError(error.to_string()));
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_commands() {
        assert_eq!(ControlCommand::parse("START\n"), Some(ControlCommand::Start));
        assert_eq!(ControlCommand::parse("RESET\r\n"), Some(ControlCommand::Reset));
        assert_eq!(ControlCommand::parse("STOP"), Some(ControlCommand::Stop));
        assert_eq!(ControlCommand::parse("\r\n"), None);
        assert_eq!(
            ControlCommand::parse("INITIAL(?,?)[CRYPTO] INITIAL(?,?)[ACK]\n"),
            Some(ControlCommand::Query(
                "INITIAL(?,?)[CRYPTO] INITIAL(?,?)[ACK]".to_string()
            ))
        );
    }
}
