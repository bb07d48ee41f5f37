//! 镜像源与镜像凭证数据访问层

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{HubSyncError, Result};
use crate::storage::entities::{MirrorSource, MirrorToken};
use crate::utils::time::now_string;

pub struct MirrorSourceDao<'a> {
    conn: &'a Connection,
}

impl<'a> MirrorSourceDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: i64) -> Result<Option<MirrorSource>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, source_name, info_api_url FROM mirror_sources WHERE id = ?1",
                params![id],
                Self::row_to_source,
            )
            .optional()?)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<MirrorSource>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, source_name, info_api_url FROM mirror_sources WHERE source_name = ?1",
                params![name],
                Self::row_to_source,
            )
            .optional()?)
    }

    /// 按名称插入或更新
    pub fn upsert(&self, name: &str, info_api_url: &str) -> Result<MirrorSource> {
        let now = now_string();
        self.conn
            .query_row(
                "INSERT INTO mirror_sources (source_name, info_api_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(source_name) DO UPDATE SET
                    info_api_url = excluded.info_api_url,
                    updated_at = excluded.updated_at
                 RETURNING id, source_name, info_api_url",
                params![name, info_api_url, now],
                Self::row_to_source,
            )
            .map_err(|e| HubSyncError::Database(format!("写入镜像源失败: {}", e)))
    }

    fn row_to_source(row: &Row) -> rusqlite::Result<MirrorSource> {
        Ok(MirrorSource {
            id: row.get(0)?,
            source_name: row.get(1)?,
            info_api_url: row.get(2)?,
        })
    }
}

pub struct MirrorTokenDao<'a> {
    conn: &'a Connection,
}

impl<'a> MirrorTokenDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 某个镜像源最新的凭证
    pub fn find_by_source(&self, source_name: &str) -> Result<Option<MirrorToken>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, source_name, token, concurrent_count, max_bandwidth FROM mirror_tokens
                 WHERE source_name = ?1 ORDER BY id DESC LIMIT 1",
                params![source_name],
                |row| {
                    Ok(MirrorToken {
                        id: row.get(0)?,
                        source_name: row.get(1)?,
                        token: row.get(2)?,
                        concurrent_count: row.get(3)?,
                        max_bandwidth: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn create(&self, source_name: &str, token: &str, concurrent_count: i64, max_bandwidth: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO mirror_tokens (source_name, token, concurrent_count, max_bandwidth)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source_name, token, concurrent_count, max_bandwidth],
            )
            .map_err(|e| HubSyncError::Database(format!("写入镜像凭证失败: {}", e)))?;
        Ok(self.conn.last_insert_rowid())
    }
}
