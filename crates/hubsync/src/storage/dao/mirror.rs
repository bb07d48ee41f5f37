//! 镜像数据访问层

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{HubSyncError, Result};
use crate::storage::entities::{Mirror, NewMirror};
use crate::utils::time::now_string;

const COLUMNS: &str = "id, interval, source_url, mirror_source_id, username, access_token,
    push_url, push_username, push_access_token, repository_id, last_updated_at, source_repo_path,
    local_repo_path, last_message, push_mirror_created, status, progress, next_execution_timestamp,
    priority, retry_count, remote_updated_at, current_task_id, sync_lfs, created_at, updated_at";

pub struct MirrorDao<'a> {
    conn: &'a Connection,
}

impl<'a> MirrorDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: i64) -> Result<Option<Mirror>> {
        let sql = format!("SELECT {} FROM mirrors WHERE id = ?1", COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], Self::row_to_mirror).optional()?)
    }

    pub fn find_by_source_url(&self, source_url: &str) -> Result<Option<Mirror>> {
        let sql = format!("SELECT {} FROM mirrors WHERE source_url = ?1", COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![source_url], Self::row_to_mirror)
            .optional()?)
    }

    /// 按 source_url 插入或更新
    pub fn upsert_by_source_url(&self, m: &NewMirror) -> Result<Mirror> {
        let now = now_string();
        let sql = format!(
            "INSERT INTO mirrors (
                source_url, mirror_source_id, username, access_token, push_url, repository_id,
                source_repo_path, local_repo_path, priority, sync_lfs, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(source_url) DO UPDATE SET
                mirror_source_id = excluded.mirror_source_id,
                username = excluded.username,
                access_token = excluded.access_token,
                push_url = excluded.push_url,
                repository_id = excluded.repository_id,
                source_repo_path = excluded.source_repo_path,
                local_repo_path = excluded.local_repo_path,
                priority = excluded.priority,
                sync_lfs = excluded.sync_lfs,
                updated_at = excluded.updated_at
             RETURNING {}",
            COLUMNS
        );
        self.conn
            .query_row(
                &sql,
                params![
                    m.source_url,
                    m.mirror_source_id,
                    m.username,
                    m.access_token,
                    m.push_url,
                    m.repository_id,
                    m.source_repo_path,
                    m.local_repo_path,
                    m.priority,
                    m.sync_lfs,
                    now
                ],
                Self::row_to_mirror,
            )
            .map_err(|e| HubSyncError::Database(format!("写入镜像失败: {}", e)))
    }

    pub fn list_all(&self) -> Result<Vec<Mirror>> {
        let sql = format!("SELECT {} FROM mirrors ORDER BY id", COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_mirror)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 有已完成任务、配置了 push_url 但还没建推送镜像的镜像
    pub fn list_push_mirror_candidates(&self) -> Result<Vec<Mirror>> {
        let cols = COLUMNS
            .split(',')
            .map(|c| format!("m.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM mirrors m
             WHERE m.push_mirror_created = 0 AND m.push_url != ''
               AND EXISTS (SELECT 1 FROM mirror_tasks t WHERE t.mirror_id = m.id AND t.status = 'finished')
             ORDER BY m.id",
            cols
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_mirror)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_push_mirror_created(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE mirrors SET push_mirror_created = 1, updated_at = ?1 WHERE id = ?2",
            params![now_string(), id],
        )?;
        Ok(())
    }

    pub fn update_current_task(&self, id: i64, task_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE mirrors SET current_task_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![task_id, now_string(), id],
            )
            .map_err(|e| HubSyncError::Database(format!("更新镜像当前任务失败: {}", e)))?;
        Ok(())
    }

    /// 刷新镜像状态与进度，同时记录 last_updated_at
    pub fn update_status(&self, id: i64, status: &str, progress: i64, last_message: &str) -> Result<()> {
        let now = now_string();
        self.conn
            .execute(
                "UPDATE mirrors SET status = ?1, progress = ?2, last_message = ?3,
                    last_updated_at = ?4, updated_at = ?4
                 WHERE id = ?5",
                params![status, progress, last_message, now, id],
            )
            .map_err(|e| HubSyncError::Database(format!("更新镜像状态失败: {}", e)))?;
        Ok(())
    }

    pub fn set_retry_count(&self, id: i64, retry_count: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE mirrors SET retry_count = ?1, updated_at = ?2 WHERE id = ?3",
            params![retry_count, now_string(), id],
        )?;
        Ok(())
    }

    fn row_to_mirror(row: &Row) -> rusqlite::Result<Mirror> {
        Ok(Mirror {
            id: row.get(0)?,
            interval: row.get(1)?,
            source_url: row.get(2)?,
            mirror_source_id: row.get(3)?,
            username: row.get(4)?,
            access_token: row.get(5)?,
            push_url: row.get(6)?,
            push_username: row.get(7)?,
            push_access_token: row.get(8)?,
            repository_id: row.get(9)?,
            last_updated_at: row.get(10)?,
            source_repo_path: row.get(11)?,
            local_repo_path: row.get(12)?,
            last_message: row.get(13)?,
            push_mirror_created: row.get(14)?,
            status: row.get(15)?,
            progress: row.get(16)?,
            next_execution_timestamp: row.get(17)?,
            priority: row.get(18)?,
            retry_count: row.get(19)?,
            remote_updated_at: row.get(20)?,
            current_task_id: row.get(21)?,
            sync_lfs: row.get(22)?,
            created_at: row.get(23)?,
            updated_at: row.get(24)?,
        })
    }
}
