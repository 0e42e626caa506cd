//! Oracle 表：查询记忆化与跨实例合并

pub mod merge;
pub mod table;

pub use merge::{combine_in_dir, merge_files, table_files, COMBINED_TABLE};
pub use table::{OracleKey, OracleTable};
