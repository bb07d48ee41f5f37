//! 周期性对账
//!
//! 两个扫描都在分布式锁下执行，多实例部署时每轮只有一个实例真正运行；
//! 竞争失败返回 `Ok(None)`。进度对账还负责退回心跳过期的任务。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lock::{with_lock, DistributedLock};
use crate::mirror::priority::MirrorPriority;
use crate::mirror::task::TaskStatus;
use crate::mirror::worker::{mirror_status, WorkerContext};
use crate::storage::dao::{MirrorDao, MirrorTaskDao};
use crate::storage::entities::Mirror;
use crate::utils::time::before_secs;

pub const LOCK_MIRROR_PROGRESS: &str = "mirror-progress-check";
pub const LOCK_PUSH_MIRROR: &str = "create-push-mirror";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressReport {
    pub scanned: usize,
    /// 执行者失联、被退回的任务
    pub recovered: usize,
    pub refreshed: usize,
    pub resynced: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushMirrorReport {
    pub created: usize,
    pub failed: usize,
}

pub struct MirrorReconciler {
    ctx: WorkerContext,
    lock: Arc<dyn DistributedLock>,
    task_lease: Duration,
}

/// 活跃任务状态在镜像上的展示
fn mirror_status_for(status: TaskStatus) -> Option<&'static str> {
    match status {
        TaskStatus::Running => Some(mirror_status::RUNNING),
        TaskStatus::RepoSynced => Some(mirror_status::REPO_SYNCED),
        TaskStatus::LfsStart => Some(mirror_status::LFS_SYNCING),
        _ => None,
    }
}

impl MirrorReconciler {
    pub fn new(ctx: WorkerContext, lock: Arc<dyn DistributedLock>) -> Self {
        Self {
            ctx,
            lock,
            task_lease: Duration::from_secs(600),
        }
    }

    pub fn with_task_lease(mut self, lease: Duration) -> Self {
        self.task_lease = lease;
        self
    }

    /// 退回心跳过期的任务，再用活跃任务刷新镜像状态；resync 时为最近任务失败的镜像重建任务
    pub async fn check_mirror_progress(&self, resync: bool) -> Result<Option<ProgressReport>> {
        with_lock(self.lock.as_ref(), LOCK_MIRROR_PROGRESS, || self.scan_progress(resync)).await
    }

    async fn scan_progress(&self, resync: bool) -> Result<ProgressReport> {
        let recovered = self.release_expired_tasks().await?;
        let mirrors = self.ctx.db.with_conn(|conn| MirrorDao::new(conn).list_all()).await?;
        let mut report = ProgressReport {
            scanned: mirrors.len(),
            recovered,
            ..Default::default()
        };

        for mirror in &mirrors {
            let latest = self
                .ctx
                .db
                .with_conn(|conn| MirrorTaskDao::new(conn).latest_for_mirror(mirror.id))
                .await?;
            let Some(task) = latest else { continue };

            if let Some(status) = mirror_status_for(task.status) {
                if mirror.status != status || mirror.progress != task.progress {
                    self.ctx.update_mirror(mirror.id, status, task.progress, "").await;
                    report.refreshed += 1;
                }
                continue;
            }

            if resync && task.status.is_failure() {
                match self.resync(mirror).await {
                    Ok(task_id) => {
                        info!(mirror_id = mirror.id, task_id, "已为失败镜像重建任务");
                        report.resynced += 1;
                    }
                    Err(e) => warn!(mirror_id = mirror.id, "重建镜像任务失败: {}", e),
                }
            }
        }

        debug!(
            scanned = report.scanned,
            recovered = report.recovered,
            refreshed = report.refreshed,
            resynced = report.resynced,
            "镜像进度对账完成"
        );
        Ok(report)
    }

    async fn release_expired_tasks(&self) -> Result<usize> {
        let cutoff = before_secs(self.task_lease.as_secs());
        let released = self
            .ctx
            .db
            .with_conn(|conn| MirrorTaskDao::new(conn).release_expired(&cutoff))
            .await?;
        for task in &released {
            warn!(
                task_id = task.id,
                mirror_id = task.mirror_id,
                status = %task.status,
                "任务心跳过期，已退回重新执行"
            );
            let status = if task.status == TaskStatus::RepoSynced {
                mirror_status::REPO_SYNCED
            } else {
                mirror_status::WAITING
            };
            self.ctx.update_mirror(task.mirror_id, status, task.progress, "").await;
        }
        Ok(released.len())
    }

    async fn resync(&self, mirror: &Mirror) -> Result<i64> {
        let mirror_id = mirror.id;
        let priority = mirror.priority.max(MirrorPriority::Medium.value());
        self.ctx
            .db
            .with_conn(move |conn| {
                let task = MirrorTaskDao::new(conn).create_task_cancelling_others(mirror_id, priority, "")?;
                let dao = MirrorDao::new(conn);
                dao.set_retry_count(mirror_id, 0)?;
                dao.update_status(mirror_id, mirror_status::WAITING, 0, "")?;
                Ok(task.id)
            })
            .await
    }

    /// 为已完成同步、配置了 push_url 的镜像建立推送镜像（仅 push_mirror 开启时）
    pub async fn create_push_mirror_for_finished_tasks(&self) -> Result<Option<PushMirrorReport>> {
        if !self.ctx.features.push_mirror {
            debug!("push_mirror 未开启，跳过推送镜像扫描");
            return Ok(Some(PushMirrorReport::default()));
        }
        with_lock(self.lock.as_ref(), LOCK_PUSH_MIRROR, || self.scan_push_mirrors()).await
    }

    async fn scan_push_mirrors(&self) -> Result<PushMirrorReport> {
        let candidates = self
            .ctx
            .db
            .with_conn(|conn| MirrorDao::new(conn).list_push_mirror_candidates())
            .await?;
        let mut report = PushMirrorReport::default();

        for mirror in candidates {
            match self.create_push_mirror(&mirror).await {
                Ok(()) => {
                    info!(mirror_id = mirror.id, repo = %mirror.local_repo_path, "✅ 推送镜像已创建");
                    report.created += 1;
                }
                Err(e) => {
                    warn!(mirror_id = mirror.id, "创建推送镜像失败: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn create_push_mirror(&self, mirror: &Mirror) -> Result<()> {
        let target = self.ctx.load_target(mirror).await?;
        self.ctx
            .git
            .create_push_mirror(
                &target.repo,
                &mirror.push_url,
                &mirror.push_username,
                &mirror.push_access_token,
            )
            .await?;
        let id = mirror.id;
        self.ctx
            .db
            .with_conn(move |conn| MirrorDao::new(conn).mark_push_mirror_created(id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockOptions, MemoryLock, MemoryLockTable};
    use crate::mirror::task::TaskEvent;
    use crate::mirror::worker::fixtures::*;
    use crate::storage::entities::NewMirror;
    use std::time::Duration;

    fn memory_lock(table: &MemoryLockTable) -> Arc<dyn DistributedLock> {
        Arc::new(MemoryLock::new(
            table.clone(),
            LockOptions {
                expiry: Duration::from_secs(60),
                acquire_timeout: Duration::from_millis(30),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
            },
        ))
    }

    async fn mirror_row(h: &Harness, id: i64) -> Mirror {
        h.db.with_conn(|conn| MirrorDao::new(conn).get(id)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_progress_refreshes_active_mirrors() {
        let h = harness();
        let (mirror, id) = mirror_with_task(&h.db, "ns/a", true).await;
        let mut task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        task.progress = 40;
        h.db.with_conn(|conn| MirrorTaskDao::new(conn).save_progress(&task))
            .await
            .unwrap();

        let reconciler = MirrorReconciler::new(h.ctx.clone(), memory_lock(&MemoryLockTable::default()));
        let report = reconciler.check_mirror_progress(false).await.unwrap().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.resynced, 0);

        let row = mirror_row(&h, mirror.id).await;
        assert_eq!(row.status, mirror_status::RUNNING);
        assert_eq!(row.progress, 40);
        assert_eq!(crate::mirror::worker::fixtures::task(&h.db, id).await.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_orphaned_running_task_is_recovered() {
        let h = harness();
        let (mirror, id) = mirror_with_task(&h.db, "ns/a", false).await;
        let (_, fresh_id) = mirror_with_task(&h.db, "ns/b", false).await;
        let orphan = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        let live = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        assert_eq!((orphan.id, live.id), (id, fresh_id));
        // 执行 orphan 的进程已经退出：心跳停在很久以前
        h.db.with_conn(|conn| {
            conn.execute(
                "UPDATE mirror_tasks SET updated_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        assert!(dequeue(&h.db, &[TaskStatus::Queued]).await.is_none());

        let reconciler = MirrorReconciler::new(h.ctx.clone(), memory_lock(&MemoryLockTable::default()))
            .with_task_lease(Duration::from_secs(60));
        let report = reconciler.check_mirror_progress(true).await.unwrap().unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.resynced, 0);
        assert_eq!(mirror_row(&h, mirror.id).await.status, mirror_status::WAITING);

        let again = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.retry_count, 0);
        assert_eq!(crate::mirror::worker::fixtures::task(&h.db, fresh_id).await.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_resync_recreates_failed_tasks() {
        let h = harness();
        let (mirror, id) = mirror_with_task(&h.db, "ns/a", false).await;
        let mut task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        h.ctx.transition(&mut task, TaskEvent::Fail).await.unwrap();
        h.ctx.transition(&mut task, TaskEvent::Fatal).await.unwrap();
        h.db.with_conn(|conn| MirrorDao::new(conn).set_retry_count(mirror.id, 5))
            .await
            .unwrap();

        let reconciler = MirrorReconciler::new(h.ctx.clone(), memory_lock(&MemoryLockTable::default()));
        let report = reconciler.check_mirror_progress(false).await.unwrap().unwrap();
        assert_eq!(report.resynced, 0);

        let report = reconciler.check_mirror_progress(true).await.unwrap().unwrap();
        assert_eq!(report.resynced, 1);

        let row = mirror_row(&h, mirror.id).await;
        assert_eq!(row.retry_count, 0);
        assert_ne!(row.current_task_id, id);
        let fresh = crate::mirror::worker::fixtures::task(&h.db, row.current_task_id).await;
        assert_eq!(fresh.status, TaskStatus::Queued);
        assert_eq!(fresh.priority, MirrorPriority::Medium.value());
        assert_eq!(crate::mirror::worker::fixtures::task(&h.db, id).await.status, TaskStatus::RepoFatal);
    }

    #[tokio::test]
    async fn test_progress_skips_when_lock_held() {
        let h = harness();
        let table = MemoryLockTable::default();
        let other = memory_lock(&table);
        let lease = other.try_lock(LOCK_MIRROR_PROGRESS).await.unwrap();

        let reconciler = MirrorReconciler::new(h.ctx.clone(), memory_lock(&table));
        assert!(reconciler.check_mirror_progress(true).await.unwrap().is_none());

        other.unlock(&lease).await.unwrap();
        assert!(reconciler.check_mirror_progress(true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_push_mirror_created_once_for_finished_tasks() {
        let mut h = harness();
        h.ctx.features.push_mirror = true;
        h.ctx.features.saas = true;

        let mirror = h
            .db
            .with_conn(|conn| {
                let repo = crate::storage::dao::RepositoryDao::new(conn).ensure("dataset", "ns/d", "main", "huggingface")?;
                MirrorDao::new(conn).upsert_by_source_url(&NewMirror {
                    source_url: "https://huggingface.co/datasets/ns/d".into(),
                    push_url: "https://push.example.com/ns/d.git".into(),
                    repository_id: repo.id,
                    source_repo_path: "ns/d".into(),
                    local_repo_path: "ns/d".into(),
                    priority: 1,
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        let mirror_id = mirror.id;
        let mut task = h
            .db
            .with_conn(move |conn| MirrorTaskDao::new(conn).create_task_cancelling_others(mirror_id, 1, ""))
            .await
            .unwrap();

        let reconciler = MirrorReconciler::new(h.ctx.clone(), memory_lock(&MemoryLockTable::default()));
        // 没有已完成任务时不建推送镜像
        let report = reconciler.create_push_mirror_for_finished_tasks().await.unwrap().unwrap();
        assert_eq!(report, PushMirrorReport::default());

        h.ctx.transition(&mut task, TaskEvent::Continue).await.unwrap();
        h.ctx.transition(&mut task, TaskEvent::NoLfs).await.unwrap();

        let report = reconciler.create_push_mirror_for_finished_tasks().await.unwrap().unwrap();
        assert_eq!(report.created, 1);
        let report = reconciler.create_push_mirror_for_finished_tasks().await.unwrap().unwrap();
        assert_eq!(report.created, 0);

        let pushed = h.git.push_mirrors();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0.to_string(), "datasets/ns/d");
        assert!(mirror_row(&h, mirror_id).await.push_mirror_created);
    }

    #[tokio::test]
    async fn test_push_mirror_disabled_is_noop() {
        let h = harness();
        let reconciler = MirrorReconciler::new(h.ctx.clone(), memory_lock(&MemoryLockTable::default()));
        let report = reconciler.create_push_mirror_for_finished_tasks().await.unwrap().unwrap();
        assert_eq!(report, PushMirrorReport::default());
        assert!(h.git.push_mirrors().is_empty());
    }
}
