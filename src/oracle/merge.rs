//! 合并多个实例写出的 Oracle 表文件
//!
//! 选择目录下所有 `oracleTable*.json`，按路径字典序依次合并，后面的文件覆盖前面的同名键。
//! 时间戳文件名保证较新的表排在后面。

use std::path::{Path, PathBuf};

use super::table::OracleTable;
use crate::core::error::PersistenceError;

/// 合并结果文件名
pub const COMBINED_TABLE: &str = "oracleTable.json";

/// 列出目录下的表文件，按字典序
pub fn table_files(dir: &Path) -> Result<Vec<PathBuf>, PersistenceError> {
    let pattern = dir.join("oracleTable*.json");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern).map_err(|e| PersistenceError::Pattern(e.to_string()))?;
    let mut files: Vec<PathBuf> = paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Skipping unreadable table path: {}", e);
                None
            }
        })
        .collect();
    files.sort();
    Ok(files)
}

/// 依次合并给定文件；无法读取的文件跳过并记录 warn
pub fn merge_files(files: &[PathBuf]) -> OracleTable {
    let mut merged = OracleTable::new();
    for path in files {
        match OracleTable::try_load_from(path) {
            Ok(table) => {
                tracing::debug!("Merging {} entries from {}", table.len(), path.display());
                merged.merge(table);
            }
            Err(e) => tracing::warn!("Skipping table file: {}", e),
        }
    }
    merged
}

/// 把目录下所有表合并进 `oracleTable.json`
///
/// 已有的合并结果先改名为 `oracleTable-<unix>-combined.json` 参与合并，
/// 它排在同一秒写出的新表之前，因此不会覆盖新结果。
pub fn combine_in_dir(dir: &Path) -> Result<OracleTable, PersistenceError> {
    let combined = dir.join(COMBINED_TABLE);
    if combined.exists() {
        let archived = dir.join(format!(
            "oracleTable-{}-combined.json",
            chrono::Utc::now().timestamp()
        ));
        std::fs::rename(&combined, &archived).map_err(|source| PersistenceError::Io {
            path: combined.clone(),
            source,
        })?;
    }

    let files = table_files(dir)?;
    tracing::info!("Combining {} oracle table files in {}", files.len(), dir.display());
    let merged = merge_files(&files);
    merged.save_to(&combined)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::{Packet, StatelessResetPacket};
    use crate::symbols::{AbstractSet, AbstractSymbol, ConcreteSet, ConcreteSymbol};

    fn table_with(input: &str, byte: u8) -> OracleTable {
        let mut set = ConcreteSet::new();
        set.add(ConcreteSymbol::new(Packet::StatelessReset(StatelessResetPacket {
            reset_token: vec![byte; 4],
        })));
        let mut t = OracleTable::new();
        t.record(
            vec![input.parse::<AbstractSymbol>().unwrap()],
            vec![AbstractSet::new()],
            vec![None],
            vec![set],
        );
        t
    }

    #[test]
    fn test_later_files_win() {
        let dir = tempfile::tempdir().unwrap();
        table_with("SHORT(?,?)[PING]", 1)
            .save_to(dir.path().join("oracleTable-1000.json"))
            .unwrap();
        table_with("SHORT(?,?)[PING]", 2)
            .save_to(dir.path().join("oracleTable-2000.json"))
            .unwrap();
        table_with("INITIAL(?,?)[CRYPTO]", 3)
            .save_to(dir.path().join("oracleTable-1500.json"))
            .unwrap();
        std::fs::write(dir.path().join("trace-1000.json"), "{}").unwrap();

        let files = table_files(dir.path()).unwrap();
        assert_eq!(files.len(), 3);

        let merged = combine_in_dir(dir.path()).unwrap();
        assert_eq!(merged.len(), 2);
        let expected = table_with("SHORT(?,?)[PING]", 2);
        let (key, value) = expected.iter().next().unwrap();
        assert_eq!(merged.get(key), Some(value));
        assert_eq!(
            OracleTable::load_from(dir.path().join(COMBINED_TABLE)),
            merged
        );
    }

    #[test]
    fn test_previous_combined_table_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        table_with("SHORT(?,?)[PING]", 1)
            .save_to(dir.path().join(COMBINED_TABLE))
            .unwrap();
        table_with("INITIAL(?,?)[CRYPTO]", 2)
            .save_to(dir.path().join("oracleTable-3000.json"))
            .unwrap();
        let merged = combine_in_dir(dir.path()).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oracleTable-1.json"), "[").unwrap();
        table_with("SHORT(?,?)[PING]", 1)
            .save_to(dir.path().join("oracleTable-2.json"))
            .unwrap();
        assert_eq!(merge_files(&table_files(dir.path()).unwrap()).len(), 1);
    }
}
