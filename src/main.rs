//! QUIC 状态学习适配器
//!
//! 入口：初始化日志、加载配置、连接被测实现，并在学习器行协议上服务直到 STOP 或收到信号。
//! 用法：`quic-adapter [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use quic_adapter::config::{load_config, AppConfig};
use quic_adapter::core::{Adapter, AdapterSettings, ShutdownManager};
use quic_adapter::engine::{EngineSettings, JsonCodec, UdpEngineFactory};
use quic_adapter::quic::TransportParameters;
use quic_adapter::{observability, server};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let settings = AdapterSettings::from(&cfg);

    let local_params = TransportParameters {
        max_stream_data_bidi_local: cfg.agents.max_stream_data_bidi_local,
        idle_timeout: cfg.agents.idle_timeout_ms,
        ..TransportParameters::default()
    };
    let factory = Arc::new(UdpEngineFactory::new(
        EngineSettings {
            sul_address: cfg.adapter.sul_address.clone(),
            server_name: cfg.adapter.sul_name.clone(),
            local_params,
        },
        Arc::new(JsonCodec),
    ));

    let adapter = Adapter::new(settings, factory)
        .await
        .context("Failed to connect to the system under test")?;

    let listener = TcpListener::bind(&cfg.adapter.adapter_address)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.adapter.adapter_address))?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let served = server::serve(listener, adapter, shutdown.clone()).await;

    // 致命错误以失败状态退出；其余关闭原因正常退出
    match shutdown.reason() {
        Some(reason) if reason.is_failure() => {
            let error = served
                .err()
                .map(anyhow::Error::from)
                .unwrap_or_else(|| anyhow::anyhow!("{:?}", reason));
            return Err(error.context("Adapter terminated on a fatal error"));
        }
        Some(reason) => tracing::info!("Exiting: {:?}", reason),
        None => {}
    }
    served.context("Adapter terminated")?;
    Ok(())
}
