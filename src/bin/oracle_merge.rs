//! 合并 Oracle 表文件
//!
//! 用法：`oracle-merge [dir]`（默认当前目录）。目录下所有 `oracleTable*.json` 按文件名顺序合并，
//! 同名键以后面的文件为准，结果写入 `oracleTable.json`。

use std::path::PathBuf;

use anyhow::Context;
use quic_adapter::observability;
use quic_adapter::oracle::{combine_in_dir, COMBINED_TABLE};

fn main() -> anyhow::Result<()> {
    observability::init();

    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let merged = combine_in_dir(&dir)
        .with_context(|| format!("Failed to combine oracle tables in {}", dir.display()))?;

    println!(
        "Combined {} entries into {}",
        merged.len(),
        dir.join(COMBINED_TABLE).display()
    );
    Ok(())
}
