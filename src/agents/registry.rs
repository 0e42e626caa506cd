//! 连接上的 Agent 注册表与重启监督任务

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::closing::{ClosingAgent, ClosingSettings};
use super::producer::FrameProducer;
use super::sending::{SendingAgent, SendingSettings};
use super::Agent;
use crate::quic::Connection;

/// 关闭握手的最长等待
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

type AgentList = Arc<RwLock<Vec<Arc<dyn Agent>>>>;

pub struct ConnectionAgents {
    conn: Arc<Connection>,
    agents: AgentList,
    supervisor: JoinHandle<()>,
}

impl ConnectionAgents {
    /// 为连接创建空注册表并启动监督任务
    pub fn new(conn: Arc<Connection>) -> Self {
        let agents: AgentList = Arc::new(RwLock::new(Vec::new()));
        let supervisor = tokio::spawn(supervise(conn.clone(), agents.clone()));
        Self {
            conn,
            agents,
            supervisor,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// 启动并按名称注册；同名的旧 Agent 会被替换（不会被停止）
    pub async fn add(&self, agent: Arc<dyn Agent>) {
        agent.clone().run(self.conn.clone());
        let mut agents = self.agents.write().await;
        agents.retain(|a| a.name() != agent.name());
        agents.push(agent);
    }

    pub async fn get_dyn(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// 按名称取出并向下转型到具体 Agent 类型
    pub async fn get<T: Agent>(&self, name: &str) -> Option<Arc<T>> {
        self.get_dyn(name).await?.into_any().downcast::<T>().ok()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.get_dyn(name).await.is_some()
    }

    pub async fn names(&self) -> Vec<&'static str> {
        self.agents.read().await.iter().map(|a| a.name()).collect()
    }

    /// 当前所有可以提供帧的 Agent，按注册顺序
    pub async fn frame_producers(&self) -> Vec<Arc<dyn FrameProducer>> {
        self.agents
            .read()
            .await
            .iter()
            .filter_map(|a| a.clone().frame_producer())
            .collect()
    }

    /// 停止并等待指定的 Agent
    pub async fn stop(&self, names: &[&str]) {
        let selected: Vec<Arc<dyn Agent>> = self
            .agents
            .read()
            .await
            .iter()
            .filter(|a| names.contains(&a.name()))
            .cloned()
            .collect();
        for agent in &selected {
            agent.stop();
        }
        for agent in &selected {
            agent.join().await;
        }
    }

    pub async fn stop_all(&self) {
        let all = self.agents.read().await.clone();
        for agent in &all {
            agent.stop();
        }
        for agent in &all {
            agent.join().await;
        }
    }

    /// 确保关闭与发送 Agent 存在，发起关闭握手，等待连接关闭后停止所有 Agent
    pub async fn close_connection(&self, quic_layer: bool, error_code: u64, reason: &str) {
        if !self.has("ClosingAgent").await {
            self.add(ClosingAgent::new(ClosingSettings::default())).await;
        }
        if !self.has("SendingAgent").await {
            let producers = self.frame_producers().await;
            self.add(SendingAgent::new(SendingSettings::default(), producers))
                .await;
        }
        // run() 返回时订阅已建立，Agent 即已就绪
        if let Some(closing) = self.get::<ClosingAgent>("ClosingAgent").await {
            closing.close(quic_layer, error_code, reason);
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, self.conn.closed().cancelled())
            .await
            .is_err()
        {
            tracing::warn!("Connection did not close within {:?}", CLOSE_TIMEOUT);
        }
        self.stop_all().await;
    }
}

impl Drop for ConnectionAgents {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

/// 等待重启请求：重启并等待所有 Agent，换上新信号后重新启动它们
async fn supervise(conn: Arc<Connection>, agents: AgentList) {
    loop {
        let restart = conn.restart_signal();
        tokio::select! {
            _ = conn.closed().cancelled() => break,
            _ = restart.cancelled() => {
                tracing::info!("Restarting all agents");
                let all = agents.read().await.clone();
                for agent in &all {
                    agent.restart();
                    agent.join().await;
                }
                conn.rearm_restart();
                for agent in &all {
                    agent.clone().run(conn.clone());
                }
                conn.mark_restarted();
                tracing::info!("Restarting all agents: done");
            }
        }
    }
}
