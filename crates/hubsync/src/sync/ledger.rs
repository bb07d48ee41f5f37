//! 源站侧的版本账本

use tracing::debug;

use crate::error::Result;
use crate::storage::dao::sync_version::{NewSyncVersion, SyncVersionDao};
use crate::storage::entities::{RepoType, SyncVersion};
use crate::storage::Database;
use crate::sync::types::LatestResponse;
use crate::utils::time::now_string;

/// 每次 latest 返回的最大条数
pub const LATEST_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct SyncVersionLedger {
    db: Database,
    source_id: i64,
}

impl SyncVersionLedger {
    pub fn new(db: Database, source_id: i64) -> Self {
        Self { db, source_id }
    }

    pub fn source_id(&self) -> i64 {
        self.source_id
    }

    /// 仓库内容变化时追加一条版本
    pub async fn record_change(&self, repo_path: &str, repo_type: RepoType, change_log: &str) -> Result<SyncVersion> {
        let new = NewSyncVersion {
            source_id: self.source_id,
            repo_path: repo_path.to_string(),
            repo_type: repo_type.as_str().to_string(),
            last_modified_at: now_string(),
            change_log: change_log.to_string(),
        };
        let v = self.db.with_conn(|conn| SyncVersionDao::new(conn).create(&new)).await?;
        debug!(version = v.version, repo = %v.repo_path, "记录版本变更");
        Ok(v)
    }

    pub async fn latest_after(&self, cur: i64, limit: usize) -> Result<LatestResponse> {
        let (versions, has_more) = self
            .db
            .with_conn(|conn| SyncVersionDao::new(conn).latest_after(cur, limit))
            .await?;
        Ok(LatestResponse { versions, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_after_respects_batch_size() {
        let ledger = SyncVersionLedger::new(Database::open_in_memory().unwrap(), 1);
        for i in 0..(LATEST_BATCH_SIZE + 5) {
            ledger.record_change(&format!("ns/r{}", i), RepoType::Model, "").await.unwrap();
        }
        let first = ledger.latest_after(0, LATEST_BATCH_SIZE).await.unwrap();
        assert_eq!(first.versions.len(), LATEST_BATCH_SIZE);
        assert!(first.has_more);
        let cur = first.next_cursor(0);
        assert_eq!(cur, LATEST_BATCH_SIZE as i64);

        let second = ledger.latest_after(cur, LATEST_BATCH_SIZE).await.unwrap();
        assert_eq!(second.versions.len(), 5);
        assert!(!second.has_more);
        assert!(second.versions.iter().all(|v| v.version > cur));
    }
}
