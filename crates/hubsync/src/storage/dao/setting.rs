//! 同步客户端设置数据访问层

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{HubSyncError, Result};
use crate::storage::dao::TransactionManager;
use crate::storage::entities::SyncClientSetting;

pub struct SyncClientSettingDao<'a> {
    conn: &'a Connection,
}

impl<'a> SyncClientSettingDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self) -> Result<Option<SyncClientSetting>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, token, concurrent_count, max_bandwidth FROM sync_client_settings
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(SyncClientSetting {
                        id: row.get(0)?,
                        token: row.get(1)?,
                        concurrent_count: row.get(2)?,
                        max_bandwidth: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// 先删后插，保证只有一条生效
    pub fn replace(&self, token: &str, concurrent_count: i64, max_bandwidth: i64) -> Result<SyncClientSetting> {
        TransactionManager::new(self.conn).execute(|conn| {
            conn.execute("DELETE FROM sync_client_settings", [])?;
            conn.execute(
                "INSERT INTO sync_client_settings (token, concurrent_count, max_bandwidth) VALUES (?1, ?2, ?3)",
                params![token, concurrent_count, max_bandwidth],
            )
            .map_err(|e| HubSyncError::Database(format!("写入同步设置失败: {}", e)))?;
            Ok(SyncClientSetting {
                id: conn.last_insert_rowid(),
                token: token.to_string(),
                concurrent_count,
                max_bandwidth,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_support::memory_conn;

    #[test]
    fn test_replace_keeps_single_row() {
        let conn = memory_conn();
        let dao = SyncClientSettingDao::new(&conn);
        assert!(dao.get().unwrap().is_none());
        dao.replace("t1", 2, 0).unwrap();
        dao.replace("t2", 4, 100).unwrap();
        let s = dao.get().unwrap().unwrap();
        assert_eq!(s.token, "t2");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_client_settings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
