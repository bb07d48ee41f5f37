//! 多实例拉取同步
//!
//! 源站维护单调递增的版本账本；下游按游标拉取新版本，再逐个拉取仓库内容写入本地。

pub mod cleaner;
pub mod client;
pub mod engine;
pub mod ledger;
pub mod repo_filter;
pub mod types;

pub use cleaner::{CleanupReport, SyncVersionCleaner};
pub use client::{HttpSyncClient, LedgerSyncClient, SyncClient};
pub use engine::{SyncEngine, SyncReport};
pub use ledger::SyncVersionLedger;
pub use repo_filter::{LocalRepo, RepoFilter};
pub use types::{strip_source_prefix, LatestResponse, RepoInfo};
