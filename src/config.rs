//! 适配器配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ADAPTER__*` 覆盖
//! （双下划线表示嵌套，如 `ADAPTER__ADAPTER__WAIT_TIME_MS=500`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub adapter: AdapterSection,
    pub agents: AgentsSection,
    pub oracle: OracleSection,
}

/// [adapter] 段：监听地址、被测系统、HTTP 模式与各个等待时长
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterSection {
    /// 学习器连接的 TCP 地址
    #[serde(default = "default_adapter_address")]
    pub adapter_address: String,
    /// 被测 QUIC 实现的地址
    #[serde(default = "default_sul_address")]
    pub sul_address: String,
    /// SNI / HTTP authority
    #[serde(default = "default_sul_name")]
    pub sul_name: String,
    #[serde(default)]
    pub http3: bool,
    #[serde(default = "default_http_path")]
    pub http_path: String,
    /// 记录包级 trace，STOP 时写入 trace-<unix>.json
    #[serde(default)]
    pub tracing: bool,
    /// 每个符号注入后的等待（毫秒）
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
    /// 输出中出现 RETRY 后的额外等待（毫秒）
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_adapter_address() -> String {
    "0.0.0.0:3333".to_string()
}

fn default_sul_address() -> String {
    "implementation:4433".to_string()
}

fn default_sul_name() -> String {
    "quic.tiferrei.com".to_string()
}

fn default_http_path() -> String {
    "/index.html".to_string()
}

fn default_wait_time_ms() -> u64 {
    300
}

fn default_retry_wait_ms() -> u64 {
    400
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for AdapterSection {
    fn default() -> Self {
        Self {
            adapter_address: default_adapter_address(),
            sul_address: default_sul_address(),
            sul_name: default_sul_name(),
            http3: false,
            http_path: default_http_path(),
            tracing: false,
            wait_time_ms: default_wait_time_ms(),
            retry_wait_ms: default_retry_wait_ms(),
            output_dir: default_output_dir(),
        }
    }
}

/// [agents] 段：连接级策略
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// 本端为自己发起的双向流通告的接收额度
    #[serde(default = "default_max_stream_data_bidi_local")]
    pub max_stream_data_bidi_local: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub keep_dropped_encryption_levels: bool,
}

fn default_mtu() -> usize {
    1200
}

fn default_max_stream_data_bidi_local() -> u64 {
    80
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            max_stream_data_bidi_local: default_max_stream_data_bidi_local(),
            idle_timeout_ms: default_idle_timeout_ms(),
            keep_dropped_encryption_levels: true,
        }
    }
}

/// [oracle] 段：启动时加载的表与停止时是否合并
#[derive(Debug, Clone, Deserialize)]
pub struct OracleSection {
    /// 启动时加载的已有表；文件缺失时从空表开始
    #[serde(default = "default_table_path")]
    pub table_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub merge_on_stop: bool,
}

fn default_table_path() -> Option<PathBuf> {
    Some(PathBuf::from("oracleTable.json"))
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            table_path: default_table_path(),
            merge_on_stop: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ADAPTER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ADAPTER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ADAPTER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
