//! 版本账本数据访问层

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{HubSyncError, Result};
use crate::storage::entities::SyncVersion;
use crate::utils::time::now_string;

const COLUMNS: &str =
    "version, source_id, repo_path, repo_type, last_modified_at, change_log, completed";

/// 追加到账本的新条目（version 由数据库分配）
#[derive(Debug, Clone, Default)]
pub struct NewSyncVersion {
    pub source_id: i64,
    pub repo_path: String,
    pub repo_type: String,
    pub last_modified_at: String,
    pub change_log: String,
}

pub struct SyncVersionDao<'a> {
    conn: &'a Connection,
}

impl<'a> SyncVersionDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 源站追加一条变更，返回分配到的版本
    pub fn create(&self, v: &NewSyncVersion) -> Result<SyncVersion> {
        let sql = format!(
            "INSERT INTO sync_versions (source_id, repo_path, repo_type, last_modified_at, change_log)
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING {}",
            COLUMNS
        );
        self.conn
            .query_row(
                &sql,
                params![v.source_id, v.repo_path, v.repo_type, v.last_modified_at, v.change_log],
                Self::row_to_version,
            )
            .map_err(|e| HubSyncError::Database(format!("写入 sync_versions 失败: {}", e)))
    }

    /// 下游按源站的 version 原样落库；已存在时忽略，返回是否新插入
    pub fn insert_with_version(&self, v: &SyncVersion) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO sync_versions
                (version, source_id, repo_path, repo_type, last_modified_at, change_log, completed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                v.version,
                v.source_id,
                v.repo_path,
                v.repo_type,
                v.last_modified_at,
                v.change_log
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, version: i64) -> Result<Option<SyncVersion>> {
        let sql = format!("SELECT {} FROM sync_versions WHERE version = ?1", COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![version], Self::row_to_version)
            .optional()?)
    }

    /// 本地最大版本号，即当前游标；空表为 0
    pub fn get_latest_version(&self) -> Result<i64> {
        let v: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM sync_versions", [], |row| row.get(0))
            .map_err(|e| HubSyncError::Database(format!("查询最大版本失败: {}", e)))?;
        Ok(v.unwrap_or(0))
    }

    /// version > cur 的条目，升序，最多 limit 条；第二个返回值表示之后是否还有更多
    pub fn latest_after(&self, cur: i64, limit: usize) -> Result<(Vec<SyncVersion>, bool)> {
        let sql = format!(
            "SELECT {} FROM sync_versions WHERE version > ?1 ORDER BY version ASC LIMIT ?2",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut versions = stmt
            .query_map(params![cur, (limit + 1) as i64], Self::row_to_version)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HubSyncError::Database(format!("查询最新版本失败: {}", e)))?;
        let has_more = versions.len() > limit;
        versions.truncate(limit);
        Ok((versions, has_more))
    }

    /// 每个 (source_id, repo_path, repo_type) 取最新的未完成版本，按版本升序
    pub fn find_not_completed_distinct(&self) -> Result<Vec<SyncVersion>> {
        let sql = format!(
            "SELECT {cols} FROM sync_versions WHERE version IN (
                SELECT MAX(version) FROM sync_versions WHERE completed = 0
                GROUP BY source_id, repo_path, repo_type
             ) ORDER BY version ASC",
            cols = COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_version)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HubSyncError::Database(format!("查询未完成版本失败: {}", e)))?;
        Ok(rows)
    }

    /// 将同一仓库 version <= v.version 的条目标记为已完成
    pub fn complete(&self, v: &SyncVersion) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "UPDATE sync_versions SET completed = 1, updated_at = ?1
                 WHERE source_id = ?2 AND repo_path = ?3 AND repo_type = ?4 AND version <= ?5",
                params![now_string(), v.source_id, v.repo_path, v.repo_type, v.version],
            )
            .map_err(|e| HubSyncError::Database(format!("标记版本完成失败: {}", e)))?;
        Ok(n)
    }

    /// 每个 (repo_path, repo_type) 只保留最大版本
    pub fn delete_old_versions(&self) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "DELETE FROM sync_versions WHERE version NOT IN (
                    SELECT MAX(version) FROM sync_versions GROUP BY repo_path, repo_type
                 )",
                [],
            )
            .map_err(|e| HubSyncError::Database(format!("删除旧版本失败: {}", e)))?;
        Ok(n)
    }

    pub fn distinct_repo_types(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT repo_type FROM sync_versions ORDER BY repo_type")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// 按版本游标分页读取某一类型的条目
    pub fn page_by_type(&self, repo_type: &str, after_version: i64, limit: usize) -> Result<Vec<SyncVersion>> {
        let sql = format!(
            "SELECT {} FROM sync_versions WHERE repo_type = ?1 AND version > ?2
             ORDER BY version ASC LIMIT ?3",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![repo_type, after_version, limit as i64], Self::row_to_version)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HubSyncError::Database(format!("分页查询版本失败: {}", e)))?;
        Ok(rows)
    }

    /// 删除该类型下路径不在 keep 中的所有条目；keep 为空时删除该类型全部条目
    pub fn batch_delete_others(&self, repo_type: &str, keep: &[String]) -> Result<usize> {
        if keep.is_empty() {
            let n = self
                .conn
                .execute("DELETE FROM sync_versions WHERE repo_type = ?1", params![repo_type])?;
            return Ok(n);
        }

        // 白名单可能很大，走临时表避免超过绑定参数上限
        self.conn.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS sync_keep_paths (path TEXT PRIMARY KEY);
             DELETE FROM sync_keep_paths;",
        )?;
        {
            let mut insert = self
                .conn
                .prepare("INSERT OR IGNORE INTO sync_keep_paths (path) VALUES (?1)")?;
            for path in keep {
                insert.execute(params![path])?;
            }
        }
        let n = self
            .conn
            .execute(
                "DELETE FROM sync_versions WHERE repo_type = ?1
                 AND repo_path NOT IN (SELECT path FROM sync_keep_paths)",
                params![repo_type],
            )
            .map_err(|e| HubSyncError::Database(format!("批量删除版本失败: {}", e)))?;
        self.conn.execute("DELETE FROM sync_keep_paths", [])?;
        Ok(n)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_versions", [], |row| row.get(0))?)
    }

    fn row_to_version(row: &Row) -> rusqlite::Result<SyncVersion> {
        Ok(SyncVersion {
            version: row.get(0)?,
            source_id: row.get(1)?,
            repo_path: row.get(2)?,
            repo_type: row.get(3)?,
            last_modified_at: row.get(4)?,
            change_log: row.get(5)?,
            completed: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_support::memory_conn;

    fn new(path: &str, repo_type: &str) -> NewSyncVersion {
        NewSyncVersion {
            source_id: 1,
            repo_path: path.to_string(),
            repo_type: repo_type.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_versions_strictly_increase() {
        let conn = memory_conn();
        let dao = SyncVersionDao::new(&conn);
        let a = dao.create(&new("ns/a", "model")).unwrap();
        let b = dao.create(&new("ns/b", "model")).unwrap();
        assert!(b.version > a.version);
        assert_eq!(dao.get_latest_version().unwrap(), b.version);
    }

    #[test]
    fn test_latest_after_pages() {
        let conn = memory_conn();
        let dao = SyncVersionDao::new(&conn);
        for i in 0..5 {
            dao.create(&new(&format!("ns/r{}", i), "dataset")).unwrap();
        }
        let (batch, more) = dao.latest_after(0, 2).unwrap();
        assert_eq!(batch.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
        assert!(more);
        let (batch, more) = dao.latest_after(4, 2).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!more);
        let (batch, more) = dao.latest_after(5, 2).unwrap();
        assert!(batch.is_empty());
        assert!(!more);
    }

    #[test]
    fn test_insert_with_version_is_idempotent() {
        let conn = memory_conn();
        let dao = SyncVersionDao::new(&conn);
        let v = SyncVersion {
            version: 42,
            source_id: 1,
            repo_path: "ns/a".into(),
            repo_type: "model".into(),
            last_modified_at: String::new(),
            change_log: String::new(),
            completed: true,
        };
        assert!(dao.insert_with_version(&v).unwrap());
        assert!(!dao.insert_with_version(&v).unwrap());
        let stored = dao.get(42).unwrap().unwrap();
        assert!(!stored.completed);
        assert_eq!(dao.get_latest_version().unwrap(), 42);
    }

    #[test]
    fn test_not_completed_distinct_and_complete() {
        let conn = memory_conn();
        let dao = SyncVersionDao::new(&conn);
        dao.create(&new("ns/a", "model")).unwrap();
        dao.create(&new("ns/b", "model")).unwrap();
        dao.create(&new("ns/a", "model")).unwrap();

        let pending = dao.find_not_completed_distinct().unwrap();
        assert_eq!(
            pending.iter().map(|v| (v.repo_path.as_str(), v.version)).collect::<Vec<_>>(),
            vec![("ns/b", 2), ("ns/a", 3)]
        );

        assert_eq!(dao.complete(&pending[1]).unwrap(), 2);
        let pending = dao.find_not_completed_distinct().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].repo_path, "ns/b");
    }

    #[test]
    fn test_delete_old_and_batch_delete_others() {
        let conn = memory_conn();
        let dao = SyncVersionDao::new(&conn);
        dao.create(&new("ns/a", "model")).unwrap();
        dao.create(&new("ns/a", "model")).unwrap();
        dao.create(&new("ns/b", "model")).unwrap();
        dao.create(&new("ns/c", "dataset")).unwrap();

        assert_eq!(dao.delete_old_versions().unwrap(), 1);
        assert_eq!(dao.count().unwrap(), 3);

        let removed = dao.batch_delete_others("model", &["ns/a".to_string()]).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dao.page_by_type("model", 0, 10).unwrap().len(), 1);

        assert_eq!(dao.batch_delete_others("dataset", &[]).unwrap(), 1);
        assert_eq!(dao.count().unwrap(), 1);
        assert_eq!(dao.distinct_repo_types().unwrap(), vec!["model".to_string()]);
    }
}
