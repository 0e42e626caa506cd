//! 请求/应答通道：发起方阻塞到 Agent 回复，或 Agent 停止时得到 None

use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

use super::{wait_close, AgentBase};
use crate::quic::lock;

/// 一次调用：参数 + 应答端
pub struct Call<Req, Resp> {
    pub args: Req,
    reply: oneshot::Sender<Resp>,
}

impl<Req, Resp> Call<Req, Resp> {
    pub fn reply(self, resp: Resp) {
        let _ = self.reply.send(resp);
    }
}

pub struct Rendezvous<Req, Resp> {
    tx: Mutex<Option<mpsc::Sender<Call<Req, Resp>>>>,
}

impl<Req, Resp> Default for Rendezvous<Req, Resp> {
    fn default() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }
}

impl<Req: Send, Resp: Send> Rendezvous<Req, Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新一轮工作循环打开通道，返回接收端
    pub fn open(&self) -> mpsc::Receiver<Call<Req, Resp>> {
        let (tx, rx) = mpsc::channel(1);
        *lock(&self.tx) = Some(tx);
        rx
    }

    /// 发起调用；Agent 未运行、已停止或在处理前退出时返回 None
    pub async fn call(&self, base: &AgentBase, args: Req) -> Option<Resp> {
        let mut close = base.close_signal()?;
        let tx = lock(&self.tx).clone()?;
        let (reply, rx) = oneshot::channel();
        tokio::select! {
            biased;
            _ = wait_close(&mut close) => return None,
            sent = tx.send(Call { args, reply }) => sent.ok()?,
        }
        rx.await.ok()
    }
}
