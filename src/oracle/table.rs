//! Oracle 表：抽象查询对 → 具体证据
//!
//! 键是 `AbstractOrderedPair` 的规范文本，同时也是持久化文件中的 JSON 键。
//! 重复记录同一个键时后写者覆盖。表只由编排器的查询循环修改。

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::PersistenceError;
use crate::symbols::{
    AbstractOrderedPair, AbstractSet, AbstractSymbol, ConcreteOrderedPair, ConcreteSet,
    ConcreteSymbol,
};

/// 规范文本形式的键；比较与哈希不需要重新解析
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OracleKey(String);

impl OracleKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&AbstractOrderedPair> for OracleKey {
    fn from(pair: &AbstractOrderedPair) -> Self {
        Self(pair.to_string())
    }
}

impl fmt::Display for OracleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OracleTable {
    entries: BTreeMap<OracleKey, ConcreteOrderedPair>,
}

impl OracleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, pair: &AbstractOrderedPair) -> Option<&ConcreteOrderedPair> {
        self.entries.get(&OracleKey::from(pair))
    }

    pub fn get(&self, key: &OracleKey) -> Option<&ConcreteOrderedPair> {
        self.entries.get(key)
    }

    /// 记录一条完整查询；返回使用的键
    pub fn record(
        &mut self,
        abstract_inputs: Vec<AbstractSymbol>,
        abstract_outputs: Vec<AbstractSet>,
        concrete_inputs: Vec<Option<ConcreteSymbol>>,
        concrete_outputs: Vec<ConcreteSet>,
    ) -> OracleKey {
        let key = OracleKey::from(&AbstractOrderedPair::new(abstract_inputs, abstract_outputs));
        self.entries.insert(
            key.clone(),
            ConcreteOrderedPair::new(concrete_inputs, concrete_outputs),
        );
        key
    }

    /// 按键合并另一张表，`other` 中的条目覆盖本表
    pub fn merge(&mut self, other: OracleTable) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OracleKey, &ConcreteOrderedPair)> {
        self.entries.iter()
    }

    /// 从文件加载；文件缺失或损坏时返回空表并记录 warn
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_load_from(path) {
            Ok(table) => {
                tracing::info!("Loaded {} oracle table entries from {}", table.len(), path.display());
                table
            }
            Err(e) => {
                tracing::warn!("Starting with an empty oracle table: {}", e);
                Self::new()
            }
        }
    }

    pub fn try_load_from(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| PersistenceError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let path = path.as_ref();
        let content = serde_json::to_string(self).map_err(|source| PersistenceError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Saved {} oracle table entries to {}", self.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::{Packet, StatelessResetPacket};

    fn sym(s: &str) -> AbstractSymbol {
        s.parse().unwrap()
    }

    fn reset_evidence(byte: u8) -> ConcreteSet {
        let mut set = ConcreteSet::new();
        set.add(ConcreteSymbol::new(Packet::StatelessReset(StatelessResetPacket {
            reset_token: vec![byte; 16],
        })));
        set
    }

    #[test]
    fn test_record_and_lookup() {
        let mut table = OracleTable::new();
        let inputs = vec![sym("INITIAL(?,?)[CRYPTO]")];
        let outputs = vec![[sym("RESET(?,?)[]")].into_iter().collect::<AbstractSet>()];
        let key = table.record(inputs.clone(), outputs.clone(), vec![None], vec![reset_evidence(1)]);
        assert_eq!(key.as_str(), "([INITIAL(?,?)[CRYPTO]],[{RESET(?,?)[]}])");
        let pair = AbstractOrderedPair::new(inputs, outputs);
        assert_eq!(table.lookup(&pair).unwrap().outputs[0], reset_evidence(1));
    }

    #[test]
    fn test_same_key_last_write_wins() {
        let mut table = OracleTable::new();
        let inputs = vec![sym("SHORT(?,?)[PING]")];
        let outputs = vec![AbstractSet::new()];
        let k1 = table.record(inputs.clone(), outputs.clone(), vec![None], vec![reset_evidence(1)]);
        let k2 = table.record(inputs, outputs, vec![None], vec![reset_evidence(2)]);
        assert_eq!(k1, k2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&k1).unwrap().outputs[0], reset_evidence(2));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oracleTable.json");
        let mut table = OracleTable::new();
        table.record(
            vec![sym("INITIAL(?,?)[CRYPTO]")],
            vec![AbstractSet::new()],
            vec![None],
            vec![ConcreteSet::new()],
        );
        table.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"([INITIAL(?,?)[CRYPTO]],[{}])\""));
        assert!(raw.contains("\"ConcreteInputs\":[null]"));

        assert_eq!(OracleTable::load_from(&path), table);
    }

    #[test]
    fn test_load_missing_or_corrupt_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OracleTable::load_from(dir.path().join("missing.json")).is_empty());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{not json").unwrap();
        assert!(OracleTable::load_from(&corrupt).is_empty());
        assert!(matches!(
            OracleTable::try_load_from(&corrupt),
            Err(PersistenceError::Json { .. })
        ));
    }

    #[test]
    fn test_save_to_unwritable_path_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("t.json");
        assert!(matches!(
            OracleTable::new().save_to(&path),
            Err(PersistenceError::Io { .. })
        ));
    }
}
