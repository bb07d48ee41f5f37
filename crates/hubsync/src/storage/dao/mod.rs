//! 数据访问层 (DAO)，每张表一个模块

pub mod mirror;
pub mod mirror_source;
pub mod mirror_task;
pub mod repository;
pub mod setting;
pub mod sync_version;

pub use mirror::MirrorDao;
pub use mirror_source::{MirrorSourceDao, MirrorTokenDao};
pub use mirror_task::MirrorTaskDao;
pub use repository::RepositoryDao;
pub use setting::SyncClientSettingDao;
pub use sync_version::SyncVersionDao;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{HubSyncError, Result};

/// 事务管理器，统一管理跨表操作的事务
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 普通（DEFERRED）事务
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        self.run(TransactionBehavior::Deferred, f)
    }

    /// `BEGIN IMMEDIATE`：开始即持有写锁，多进程并发出队时只有一个能进入
    pub fn execute_immediate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        self.run(TransactionBehavior::Immediate, f)
    }

    fn run<F, R>(&self, behavior: TransactionBehavior, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = Transaction::new_unchecked(self.conn, behavior)
            .map_err(|e| HubSyncError::Database(format!("开始事务失败: {}", e)))?;

        // 出错时 tx 被 drop，自动回滚
        let result = f(&tx)?;

        tx.commit()
            .map_err(|e| HubSyncError::Database(format!("提交事务失败: {}", e)))?;

        Ok(result)
    }
}

/// 生成 `?{start},?{start+1},...` 形式的占位符
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(",")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1, 3), "?1,?2,?3");
        assert_eq!(placeholders(2, 1), "?2");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let conn = test_support::memory_conn();
        let result: Result<()> = TransactionManager::new(&conn).execute(|c| {
            c.execute(
                "INSERT INTO sync_client_settings (token) VALUES ('t1')",
                [],
            )?;
            Err(HubSyncError::Other("boom".into()))
        });
        assert!(result.is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_client_settings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
