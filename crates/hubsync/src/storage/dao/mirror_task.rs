//! 镜像任务数据访问层
//!
//! 出队与创建都在 `BEGIN IMMEDIATE` 事务中完成：写锁在事务开始时就拿到，
//! 共享同一个 DB 文件的多个进程同一时刻只有一个能挑选并推进任务。

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{HubSyncError, Result};
use crate::mirror::task::{TaskEvent, TaskStatus};
use crate::storage::dao::{placeholders, MirrorDao, TransactionManager};
use crate::storage::entities::MirrorTask;
use crate::utils::time::now_string;

const COLUMNS: &str = "id, mirror_id, error_message, status, retry_count, payload, priority,
    before_last_commit_id, after_last_commit_id, progress, started_at, finished_at, next_retry_at,
    created_at, updated_at";

/// SQL 字面量列表，只用于内部常量状态
fn status_literals(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn non_terminal_statuses() -> Vec<TaskStatus> {
    [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::RepoSynced,
        TaskStatus::LfsStart,
        TaskStatus::RepoFailed,
        TaskStatus::Failed,
    ]
    .to_vec()
}

/// 有执行者持有、需要心跳续约的状态
const LEASED_STATUSES: [TaskStatus; 2] = [TaskStatus::Running, TaskStatus::LfsStart];

pub struct MirrorTaskDao<'a> {
    conn: &'a Connection,
}

impl<'a> MirrorTaskDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: i64) -> Result<Option<MirrorTask>> {
        let sql = format!("SELECT {} FROM mirror_tasks WHERE id = ?1", COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], Self::row_to_task).optional()?)
    }

    /// 只读状态，worker 用来检测任务是否被取消
    pub fn get_status(&self, id: i64) -> Result<Option<TaskStatus>> {
        let status: Option<String> = self
            .conn
            .query_row("SELECT status FROM mirror_tasks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        status.map(|s| s.parse()).transpose()
    }

    /// 插入一个 queued 任务
    pub fn create(&self, mirror_id: i64, priority: i64, payload: &str) -> Result<MirrorTask> {
        let now = now_string();
        let sql = format!(
            "INSERT INTO mirror_tasks (mirror_id, status, priority, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) RETURNING {}",
            COLUMNS
        );
        self.conn
            .query_row(
                &sql,
                params![mirror_id, TaskStatus::Queued.as_str(), priority, payload, now],
                Self::row_to_task,
            )
            .map_err(|e| HubSyncError::Database(format!("创建镜像任务失败: {}", e)))
    }

    /// 取消该镜像所有未结束的任务后创建新任务
    pub fn create_task_cancelling_others(&self, mirror_id: i64, priority: i64, payload: &str) -> Result<MirrorTask> {
        TransactionManager::new(self.conn).execute_immediate(|conn| {
            let now = now_string();
            let cancelled = conn.execute(
                &format!(
                    "UPDATE mirror_tasks SET status = ?1, finished_at = ?2, updated_at = ?2
                     WHERE mirror_id = ?3 AND status IN ({})",
                    status_literals(&non_terminal_statuses())
                ),
                params![TaskStatus::Cancelled.as_str(), now, mirror_id],
            )?;
            if cancelled > 0 {
                debug!("镜像 {} 已取消 {} 个旧任务", mirror_id, cancelled);
            }
            let dao = MirrorTaskDao::new(conn);
            let task = dao.create(mirror_id, priority, payload)?;
            MirrorDao::new(conn).update_current_task(mirror_id, task.id)?;
            Ok(task)
        })
    }

    /// 按优先级取出一个可执行任务并应用事件（通常是 continue）
    ///
    /// 候选条件：状态在 `statuses` 中、`next_retry_at` 已到期、同一镜像没有其他活跃任务。
    /// 排序：priority 降序，updated_at 升序，id 升序。
    pub fn dequeue_highest_priority(&self, statuses: &[TaskStatus], event: TaskEvent) -> Result<Option<MirrorTask>> {
        if statuses.is_empty() {
            return Ok(None);
        }
        TransactionManager::new(self.conn).execute_immediate(|conn| {
            let now = now_string();
            let sql = format!(
                "SELECT {cols} FROM mirror_tasks t
                 WHERE t.status IN ({ph})
                   AND (t.next_retry_at IS NULL OR t.next_retry_at <= ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM mirror_tasks o
                       WHERE o.mirror_id = t.mirror_id AND o.id != t.id AND o.status IN ({active})
                   )
                 ORDER BY t.priority DESC, t.updated_at ASC, t.id ASC
                 LIMIT 1",
                cols = COLUMNS,
                ph = placeholders(2, statuses.len()),
                active = status_literals(&TaskStatus::ACTIVE),
            );
            let mut values: Vec<String> = Vec::with_capacity(statuses.len() + 1);
            values.push(now.clone());
            values.extend(statuses.iter().map(|s| s.as_str().to_string()));

            let task = conn
                .query_row(&sql, params_from_iter(values.iter()), Self::row_to_task)
                .optional()
                .map_err(|e| HubSyncError::Database(format!("查询 mirror_tasks 失败: {}", e)))?;
            let Some(mut task) = task else {
                return Ok(None);
            };

            task.started_at = Some(now);
            MirrorTaskDao::new(conn).transition(&mut task, event)?;
            MirrorDao::new(conn).update_current_task(task.mirror_id, task.id)?;
            Ok(Some(task))
        })
    }

    /// 应用事件并持久化任务的全部可变字段
    ///
    /// 以旧状态做条件更新：若期间状态已被其他进程修改（例如被取消），返回 InvalidTransition，
    /// 其中 from 为库中的实际状态。
    pub fn transition(&self, task: &mut MirrorTask, event: TaskEvent) -> Result<()> {
        let from = task.status;
        let to = from.transition(event)?;
        let now = now_string();
        let finished_at = if to.is_terminal() {
            Some(now.clone())
        } else {
            task.finished_at.clone()
        };

        let n = self
            .conn
            .execute(
                "UPDATE mirror_tasks SET
                    status = ?1, error_message = ?2, retry_count = ?3, payload = ?4,
                    before_last_commit_id = ?5, after_last_commit_id = ?6, progress = ?7,
                    started_at = ?8, finished_at = ?9, next_retry_at = ?10, updated_at = ?11
                 WHERE id = ?12 AND status = ?13",
                params![
                    to.as_str(),
                    task.error_message,
                    task.retry_count,
                    task.payload,
                    task.before_last_commit_id,
                    task.after_last_commit_id,
                    task.progress,
                    task.started_at,
                    finished_at,
                    task.next_retry_at,
                    now,
                    task.id,
                    from.as_str()
                ],
            )
            .map_err(|e| HubSyncError::Database(format!("更新 mirror_tasks 失败: {}", e)))?;

        if n == 0 {
            let actual = self
                .get_status(task.id)?
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(HubSyncError::InvalidTransition {
                from: actual,
                event: event.as_str().to_string(),
            });
        }

        task.status = to;
        task.finished_at = finished_at;
        task.updated_at = now;
        Ok(())
    }

    /// 仅持久化进度相关字段，不改变状态
    pub fn save_progress(&self, task: &MirrorTask) -> Result<()> {
        self.conn.execute(
            "UPDATE mirror_tasks SET progress = ?1, payload = ?2, before_last_commit_id = ?3,
                after_last_commit_id = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                task.progress,
                task.payload,
                task.before_last_commit_id,
                task.after_last_commit_id,
                now_string(),
                task.id
            ],
        )?;
        Ok(())
    }

    /// 心跳：刷新正在执行的任务的 updated_at，返回任务是否仍在执行
    pub fn touch(&self, id: i64) -> Result<bool> {
        let n = self.conn.execute(
            &format!(
                "UPDATE mirror_tasks SET updated_at = ?1 WHERE id = ?2 AND status IN ({})",
                status_literals(&LEASED_STATUSES)
            ),
            params![now_string(), id],
        )?;
        Ok(n == 1)
    }

    /// 把心跳早于 `cutoff` 的 running / lfs_start 任务退回可出队状态
    ///
    /// 走 retry 事件但不增加 retry_count，也不设置 next_retry_at：执行它的进程已经不在了，
    /// 这不是任务本身的失败。repo_synced 没有执行者，不在此列。
    pub fn release_expired(&self, cutoff: &str) -> Result<Vec<MirrorTask>> {
        TransactionManager::new(self.conn).execute_immediate(|conn| {
            let sql = format!(
                "SELECT {} FROM mirror_tasks WHERE status IN ({}) AND updated_at < ?1 ORDER BY id",
                COLUMNS,
                status_literals(&LEASED_STATUSES)
            );
            let expired = {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![cutoff], Self::row_to_task)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            let dao = MirrorTaskDao::new(conn);
            let mut released = Vec::with_capacity(expired.len());
            for mut task in expired {
                let last_seen = task.updated_at.clone();
                task.started_at = None;
                task.next_retry_at = None;
                task.error_message = format!("执行进程失联（最后心跳 {}），任务已退回", last_seen);
                dao.transition(&mut task, TaskEvent::Retry)?;
                released.push(task);
            }
            Ok(released)
        })
    }

    pub fn latest_for_mirror(&self, mirror_id: i64) -> Result<Option<MirrorTask>> {
        let sql = format!(
            "SELECT {} FROM mirror_tasks WHERE mirror_id = ?1 ORDER BY id DESC LIMIT 1",
            COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![mirror_id], Self::row_to_task)
            .optional()?)
    }

    pub fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<MirrorTask>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM mirror_tasks WHERE status IN ({}) ORDER BY id",
            COLUMNS,
            placeholders(1, statuses.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), Self::row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_active_for_mirror(&self, mirror_id: i64) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM mirror_tasks WHERE mirror_id = ?1 AND status IN ({})",
            status_literals(&TaskStatus::ACTIVE)
        );
        Ok(self.conn.query_row(&sql, params![mirror_id], |row| row.get(0))?)
    }

    fn row_to_task(row: &Row) -> rusqlite::Result<MirrorTask> {
        let status: String = row.get(3)?;
        let status = status
            .parse::<TaskStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        Ok(MirrorTask {
            id: row.get(0)?,
            mirror_id: row.get(1)?,
            error_message: row.get(2)?,
            status,
            retry_count: row.get(4)?,
            payload: row.get(5)?,
            priority: row.get(6)?,
            before_last_commit_id: row.get(7)?,
            after_last_commit_id: row.get(8)?,
            progress: row.get(9)?,
            started_at: row.get(10)?,
            finished_at: row.get(11)?,
            next_retry_at: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}
