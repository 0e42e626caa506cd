//! 适配器编排器：学习器查询的主控逻辑
//!
//! 负责：建立连接与 Agent 会话（固定的策略覆盖），逐个注入查询符号，等待并抽象观察结果，
//! 把整条查询记入 Oracle 表，处理 START / RESET / STOP。
//!
//! 查询严格串行处理；连接、Agent 注册表与 Oracle 表都归编排器所有，RESET 时整体替换会话。

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agents::{
    AckAgent, ClosingAgent, ClosingSettings, ConnectionAgents, CryptoAgent, CryptoSettings,
    FlowControlAgent, FlowControlSettings, FrameQueueAgent, HttpAgent, HttpVersion,
    SendingAgent, SendingSettings,
};
use crate::config::AppConfig;
use crate::core::error::{AdapterError, ParseError};
use crate::core::observation::Observation;
use crate::core::state::{AdapterPhase, AdapterStatus};
use crate::core::trace::TraceRecorder;
use crate::engine::EngineFactory;
use crate::oracle::{combine_in_dir, OracleTable};
use crate::quic::{
    lock, Connection, EncryptionLevel, Frame, FrameRequest, FrameType, PacketType, PnSpace,
    QueuedFrame,
};
use crate::symbols::AbstractSymbol;

/// 注入时能处理的帧种类；其余种类让整个实例终止
const INJECTABLE: [FrameType; 8] = [
    FrameType::Ack,
    FrameType::Ping,
    FrameType::Crypto,
    FrameType::Padding,
    FrameType::Stream,
    FrameType::MaxData,
    FrameType::MaxStreamData,
    FrameType::HandshakeDone,
];

const ALL_PN_SPACES: [PnSpace; 4] = [
    PnSpace::NoSpace,
    PnSpace::Initial,
    PnSpace::Handshake,
    PnSpace::AppData,
];

/// 编排器在构造与 RESET 时使用的不可变设置
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub sul_address: String,
    pub sul_name: String,
    pub http_version: HttpVersion,
    pub http_path: String,
    pub tracing: bool,
    pub wait_time: Duration,
    pub retry_wait: Duration,
    pub output_dir: PathBuf,
    pub mtu: usize,
    pub max_stream_data_bidi_local: u64,
    pub idle_timeout_ms: u64,
    pub keep_dropped_encryption_levels: bool,
    pub table_path: Option<PathBuf>,
    pub merge_on_stop: bool,
}

impl From<&AppConfig> for AdapterSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            sul_address: cfg.adapter.sul_address.clone(),
            sul_name: cfg.adapter.sul_name.clone(),
            http_version: if cfg.adapter.http3 {
                HttpVersion::Http3
            } else {
                HttpVersion::Http09
            },
            http_path: cfg.adapter.http_path.clone(),
            tracing: cfg.adapter.tracing,
            wait_time: Duration::from_millis(cfg.adapter.wait_time_ms),
            retry_wait: Duration::from_millis(cfg.adapter.retry_wait_ms),
            output_dir: cfg.adapter.output_dir.clone(),
            mtu: cfg.agents.mtu,
            max_stream_data_bidi_local: cfg.agents.max_stream_data_bidi_local,
            idle_timeout_ms: cfg.agents.idle_timeout_ms,
            keep_dropped_encryption_levels: cfg.agents.keep_dropped_encryption_levels,
            table_path: cfg.oracle.table_path.clone(),
            merge_on_stop: cfg.oracle.merge_on_stop,
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// 一个连接实例及挂在上面的 Agent；RESET 时整体替换
struct Session {
    conn: Arc<Connection>,
    agents: ConnectionAgents,
    ack: Arc<AckAgent>,
    flow_control: Arc<FlowControlAgent>,
    http: Arc<HttpAgent>,
    observer: JoinHandle<()>,
}

impl Session {
    async fn build(
        settings: &AdapterSettings,
        factory: &dyn EngineFactory,
        observation: &Arc<Mutex<Observation>>,
    ) -> Result<Self, AdapterError> {
        let engine = factory.connect().await?;
        let conn = engine.connection;
        conn.update_local_params(|p| {
            p.max_stream_data_bidi_local = settings.max_stream_data_bidi_local;
            p.idle_timeout = settings.idle_timeout_ms;
        });

        // 先订阅再启动 Agent，握手的第一个包也能被观察到
        let observer = spawn_observer(&conn, observation.clone());

        let agents = ConnectionAgents::new(conn.clone());
        let ack = AckAgent::new(&ALL_PN_SPACES);
        let flow_control = FlowControlAgent::new(FlowControlSettings {
            disable_frame_sending: true,
            dont_slide_credit_window: true,
            synthesized_stream_limit: settings.max_stream_data_bidi_local * 2,
        });
        let http = HttpAgent::new(settings.http_version, flow_control.clone());

        agents.add(FrameQueueAgent::new()).await;
        agents.add(ack.clone()).await;
        agents
            .add(CryptoAgent::new(
                CryptoSettings {
                    disable_frame_sending: true,
                },
                engine.handshake,
            ))
            .await;
        agents.add(flow_control.clone()).await;
        agents.add(http.clone()).await;
        agents
            .add(ClosingAgent::new(ClosingSettings {
                wait_for_first_packet: true,
            }))
            .await;
        let producers = agents.frame_producers().await;
        agents
            .add(SendingAgent::new(
                SendingSettings {
                    mtu: settings.mtu,
                    keep_dropped_encryption_levels: settings.keep_dropped_encryption_levels,
                    dont_coalesce_zero_rtt: false,
                },
                producers,
            ))
            .await;

        tracing::info!(
            "Connection {} ready with agents {:?}",
            conn.odcid_hex(),
            agents.names().await
        );
        Ok(Self {
            conn,
            agents,
            ack,
            flow_control,
            http,
            observer,
        })
    }

    /// 发起关闭握手，停止所有 Agent 与观察任务
    async fn shutdown(&self, reason: &str) {
        self.agents.close_connection(true, 0, reason).await;
        self.conn.close();
        self.observer.abort();
    }
}

/// 把连接的收发包喂给观察缓冲区，直到连接关闭
fn spawn_observer(conn: &Arc<Connection>, observation: Arc<Mutex<Observation>>) -> JoinHandle<()> {
    let mut incoming = conn.incoming_packets.subscribe();
    let mut outgoing = conn.outgoing_packets.subscribe();
    let conn = conn.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = conn.closed().cancelled() => break,
                Some(packet) = incoming.recv() => {
                    lock(&observation).on_incoming(&packet, conn.version());
                }
                Some(packet) = outgoing.recv() => {
                    lock(&observation).on_outgoing(&packet);
                }
                else => break,
            }
        }
    })
}

/// 把帧种类解析错误提升为实例级错误，其余解析错误只影响本条查询
fn classify_parse_error(e: ParseError) -> AdapterError {
    match e {
        ParseError::UnknownFrameKind(name) => AdapterError::UnsupportedFrameKind(name),
        other => AdapterError::Parse(other),
    }
}

/// 解析一行查询；在任何副作用发生之前拒绝无法注入的帧种类
pub fn parse_query(line: &str) -> Result<Vec<AbstractSymbol>, AdapterError> {
    let symbols = line
        .split_whitespace()
        .map(|s| s.parse::<AbstractSymbol>().map_err(classify_parse_error))
        .collect::<Result<Vec<_>, _>>()?;
    if symbols.is_empty() {
        return Err(ParseError::Malformed(line.to_string()).into());
    }
    for symbol in &symbols {
        if let Some(kind) = symbol.frame_types.iter().find(|k| !INJECTABLE.contains(k)) {
            return Err(AdapterError::UnsupportedFrameKind(kind.to_string()));
        }
    }
    Ok(symbols)
}

pub struct Adapter {
    settings: AdapterSettings,
    factory: Arc<dyn EngineFactory>,
    session: Session,
    observation: Arc<Mutex<Observation>>,
    table: OracleTable,
    trace: Option<TraceRecorder>,
    phase: AdapterPhase,
    queries: u64,
    resets: u64,
}

impl Adapter {
    /// 建立第一个连接与 Agent 会话；引擎构造失败是实例级错误
    pub async fn new(
        settings: AdapterSettings,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, AdapterError> {
        tracing::info!("SUL address: {}", settings.sul_address);
        tracing::info!("SUL name: {}", settings.sul_name);
        tracing::info!("HTTP version: {:?}, path {}", settings.http_version, settings.http_path);
        tracing::info!("Tracing: {}", settings.tracing);
        tracing::info!("Wait time: {:?}", settings.wait_time);

        let table = match &settings.table_path {
            Some(path) if path.exists() => OracleTable::load_from(path),
            _ => OracleTable::new(),
        };
        let observation = Arc::new(Mutex::new(Observation::new()));
        let session = Session::build(&settings, factory.as_ref(), &observation).await?;
        let trace = settings.tracing.then(|| {
            let recorder = TraceRecorder::new(settings.sul_address.clone());
            recorder.attach(&session.conn);
            recorder
        });

        Ok(Self {
            settings,
            factory,
            session,
            observation,
            table,
            trace,
            phase: AdapterPhase::Idle,
            queries: 0,
            resets: 0,
        })
    }

    pub fn phase(&self) -> AdapterPhase {
        self.phase
    }

    pub fn table(&self) -> &OracleTable {
        &self.table
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.session.conn
    }

    pub fn status(&self) -> AdapterStatus {
        AdapterStatus {
            phase: self.phase,
            odcid: self.session.conn.odcid_hex(),
            queries: self.queries,
            resets: self.resets,
            table_entries: self.table.len(),
        }
    }

    fn enter(&mut self, next: AdapterPhase) {
        if self.phase != next && !self.phase.can_enter(next) {
            tracing::warn!("Unexpected phase change {:?} -> {:?}", self.phase, next);
        }
        self.phase = next;
    }

    /// START：开始处理查询
    pub fn start(&mut self) {
        if self.phase == AdapterPhase::Idle {
            tracing::info!("Adapter started");
            self.enter(AdapterPhase::Running);
        }
    }

    /// 处理一行查询，返回空格分隔的输出集合编码
    pub async fn handle_query(&mut self, line: &str) -> Result<String, AdapterError> {
        let symbols = parse_query(line)?;
        self.start();
        self.queries += 1;

        let mut abstract_outputs = Vec::with_capacity(symbols.len());
        let mut concrete_inputs = Vec::with_capacity(symbols.len());
        let mut concrete_outputs = Vec::with_capacity(symbols.len());

        for symbol in &symbols {
            lock(&self.observation).begin(symbol.clone());
            match self.inject(symbol).await {
                Ok(()) => tokio::time::sleep(self.settings.wait_time).await,
                Err(AdapterError::UnavailableLevel(level)) => {
                    tracing::info!("Unable to send packet at {} level", level);
                }
                Err(e) => return Err(e),
            }

            let (outputs, sent, received) = lock(&self.observation).capture();
            let retried = outputs.contains_packet_type(PacketType::Retry);
            tracing::debug!("Observed {} for {}", outputs, symbol);
            abstract_outputs.push(outputs);
            concrete_inputs.push(sent);
            concrete_outputs.push(received);

            if retried {
                // 给连接留出重启的时间
                tokio::time::sleep(self.settings.retry_wait).await;
            }
        }

        let reply = abstract_outputs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let key = self
            .table
            .record(symbols, abstract_outputs, concrete_inputs, concrete_outputs);
        tracing::debug!("Recorded {}", key);
        Ok(reply)
    }

    /// 按头部选项与帧种类注入一个符号，然后请求在对应级别上发包
    async fn inject(&self, symbol: &AbstractSymbol) -> Result<(), AdapterError> {
        let conn = &self.session.conn;
        let level = symbol.packet_type.encryption_level();
        let space = symbol.packet_type.pn_space();
        if conn.crypto_state(level).is_none() {
            return Err(AdapterError::UnavailableLevel(level));
        }

        if let Some(version) = symbol.header_options.version {
            conn.set_version(version);
        }
        if let Some(pn) = symbol.header_options.packet_number {
            conn.set_packet_number(space, pn);
        }

        for kind in &symbol.frame_types {
            match kind {
                FrameType::Ack => {
                    if !self.session.ack.send_from_queue(space).await {
                        tracing::debug!("Nothing to acknowledge in {:?}", space);
                    }
                }
                FrameType::Ping => conn.frame_queue.submit(QueuedFrame::new(Frame::Ping, level)),
                FrameType::Padding => conn
                    .frame_queue
                    .submit(QueuedFrame::new(Frame::Padding { length: 1 }, level)),
                FrameType::HandshakeDone => conn
                    .frame_queue
                    .submit(QueuedFrame::new(Frame::HandshakeDone, level)),
                FrameType::Crypto => {
                    if !conn.release_held(FrameRequest::new(FrameType::Crypto, level)) {
                        tracing::debug!("No held CRYPTO frame at {}", level);
                    }
                }
                FrameType::Stream => self.inject_stream(level).await,
                FrameType::MaxData | FrameType::MaxStreamData => {
                    if !self
                        .session
                        .flow_control
                        .send_from_queue(FrameRequest::new(*kind, level))
                        .await
                    {
                        tracing::debug!("No {} frame available", kind);
                    }
                }
                other => return Err(AdapterError::UnsupportedFrameKind(other.to_string())),
            }
        }

        tracing::info!("Submitting request: {}", symbol);
        conn.prepare_packet.submit(level);
        Ok(())
    }

    /// 释放一个保留的请求 STREAM 帧；还没有请求时先发起一个
    async fn inject_stream(&self, level: EncryptionLevel) {
        let conn = &self.session.conn;
        let held = FrameRequest::new(FrameType::Stream, EncryptionLevel::OneRtt);
        if conn.held_count(held) == 0 {
            let host = &self.settings.sul_name;
            if self
                .session
                .http
                .send_request(&self.settings.http_path, host)
                .await
                .is_none()
            {
                tracing::debug!("HTTP request could not be prepared");
            }
        }
        // 请求按 1-RTT 保留，按符号的级别发出（0-RTT 时也走这条路）
        match conn.take_held(held) {
            Some(queued) => conn.frame_queue.submit(QueuedFrame::new(queued.frame, level)),
            None => tracing::debug!("No held STREAM frame"),
        }
    }

    /// RESET：关闭当前连接并以同样的策略重建会话
    pub async fn reset(&mut self) -> Result<(), AdapterError> {
        tracing::info!("Received RESET command");
        self.enter(AdapterPhase::Resetting);
        self.session.shutdown("Reset").await;

        let session = Session::build(&self.settings, self.factory.as_ref(), &self.observation).await?;
        lock(&self.observation).reset_session();
        if let Some(trace) = &self.trace {
            trace.attach(&session.conn);
        }
        self.session = session;
        self.resets += 1;
        self.enter(AdapterPhase::Running);
        tracing::info!("Finished RESET mechanism");
        Ok(())
    }

    /// STOP：保存 Oracle 表与 trace（失败只记录），按需合并表文件，关闭连接
    pub async fn stop(&mut self) {
        if self.phase == AdapterPhase::Stopped {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        let dir = &self.settings.output_dir;
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("Cannot create output directory {}: {}", dir.display(), e);
        }

        let table_path = dir.join(format!("oracleTable-{}.json", now));
        if let Err(e) = self.table.save_to(&table_path) {
            tracing::error!("Failed to save oracle table: {}", e);
        }
        if let Some(trace) = &self.trace {
            trace.record_result("queries", self.queries.to_string());
            trace.record_result("resets", self.resets.to_string());
            if let Err(e) = trace.save_to(dir.join(format!("trace-{}.json", now))) {
                tracing::error!("Failed to save trace: {}", e);
            }
        }
        if self.settings.merge_on_stop {
            match combine_in_dir(dir) {
                Ok(merged) => tracing::info!("Combined oracle table has {} entries", merged.len()),
                Err(e) => tracing::warn!("Failed to combine oracle tables: {}", e),
            }
        }

        self.session.shutdown("Stop").await;
        self.enter(AdapterPhase::Stopped);
        tracing::info!("Adapter stopped after {} queries", self.queries);
    }
}
