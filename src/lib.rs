//! QUIC 状态学习适配器
//!
//! 学习器通过行协议发来抽象符号；适配器驱动到被测 QUIC 实现的真实连接，观察网络行为，
//! 抽象回符号并作答，同时把每条查询连同具体包证据记入可合并的 Oracle 表。
//!
//! 模块划分：
//! - **symbols**: 抽象 / 具体符号与规范文本编码
//! - **oracle**: Oracle 表与表文件合并
//! - **quic**: 包 / 帧模型、加密级别、传输参数、广播点、连接记录
//! - **engine**: 传输、握手、引擎工厂（UDP 与内存两种）
//! - **agents**: Agent 框架与发送、流控、关闭、帧队列、ACK、握手、HTTP Agent
//! - **core**: 错误、状态、观察抽象、trace、编排器、关闭信号
//! - **server**: 面向学习器的 TCP 行协议
//! - **config**: 配置加载（TOML + 环境变量）

pub mod agents;
pub mod config;
pub mod core;
pub mod engine;
pub mod observability;
pub mod oracle;
pub mod quic;
pub mod server;
pub mod symbols;

pub use crate::core::{Adapter, AdapterError, AdapterSettings};
