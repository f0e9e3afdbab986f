//! Jobs - ジョブ状態の唯一の所有者
//!
//! Job レコードは `JobManager` のメソッド経由でのみ変更されます。

pub mod manager;

pub use manager::{JobFilter, JobManager, JobPage};
