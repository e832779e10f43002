//! Activity logging: JSONL append log plus an optional SQLite (WAL) table,
//! fed by a single logger thread.

pub mod dual;
pub mod jsonl;
#[cfg(feature = "sqlite")]
pub mod sqlite;
