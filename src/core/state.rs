//! 适配器状态：阶段与对外快照
//!
//! Idle → Running → (Resetting → Running)* → Stopped。编排器维护完整状态，
//! 对外只投影一份轻量的 AdapterStatus（日志与停止时的汇总用）。

use serde::Serialize;

/// 适配器阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AdapterPhase {
    Idle,
    Running,
    Resetting,
    Stopped,
}

impl AdapterPhase {
    /// 是否允许从当前阶段进入 `next`
    pub fn can_enter(self, next: AdapterPhase) -> bool {
        use AdapterPhase::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Resetting)
                | (Resetting, Running)
                | (Idle, Stopped)
                | (Running, Stopped)
                | (Resetting, Stopped)
        )
    }
}

/// 编排器状态快照
#[derive(Clone, Debug, Serialize)]
pub struct AdapterStatus {
    pub phase: AdapterPhase,
    /// 当前连接的原始目标连接 ID（十六进制）
    pub odcid: String,
    pub queries: u64,
    pub resets: u64,
    pub table_entries: usize,
}
