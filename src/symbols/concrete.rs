//! 具体符号：真实交换过的包，作为 Oracle 表中的证据保存

use serde::{Deserialize, Serialize};

use crate::quic::Packet;

/// 一个真实的协议包；JSON 中保留包的具体种类
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcreteSymbol(pub Packet);

impl ConcreteSymbol {
    pub fn new(packet: Packet) -> Self {
        Self(packet)
    }

    pub fn packet(&self) -> &Packet {
        &self.0
    }
}

impl From<Packet> for ConcreteSymbol {
    fn from(packet: Packet) -> Self {
        Self(packet)
    }
}

/// 去重的具体符号集合（保持到达顺序）
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcreteSet(Vec<ConcreteSymbol>);

impl ConcreteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, symbol: ConcreteSymbol) -> bool {
        if self.0.contains(&symbol) {
            return false;
        }
        self.0.push(symbol);
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConcreteSymbol> {
        self.0.iter()
    }
}

/// 一条查询的具体证据：每个位置发出的包（可能没有）与收到的包集合
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConcreteOrderedPair {
    #[serde(rename = "ConcreteInputs")]
    pub inputs: Vec<Option<ConcreteSymbol>>,
    #[serde(rename = "ConcreteOutputs")]
    pub outputs: Vec<ConcreteSet>,
}

impl ConcreteOrderedPair {
    pub fn new(inputs: Vec<Option<ConcreteSymbol>>, outputs: Vec<ConcreteSet>) -> Self {
        Self { inputs, outputs }
    }
}
