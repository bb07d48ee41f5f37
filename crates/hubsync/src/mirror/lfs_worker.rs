//! LFS 同步 worker：处理 repo_synced 任务
//!
//! 对象按组（≤10 GiB 且 ≤15 个）申请下载地址，逐个下载、校验、落盘并记断点。
//! 取消只在对象之间检查；所有对象落地后才把分支移动到新提交。
//! 进程退出打断的任务回到 repo_synced 等待下次续传，被新任务取代的任务才进入 cancelled。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HubSyncError, Result};
use crate::mirror::events::{SCENARIO_LFS_SYNC_FAILED, SCENARIO_REPO_SYNC_FINISHED};
use crate::mirror::git::{LfsPointer, MirrorSyncRequest};
use crate::mirror::lfs::{CheckpointStore, LfsDownload, LfsRemote, LfsStore};
use crate::mirror::task::{TaskEvent, TaskStatus};
use crate::mirror::worker::{mirror_status, LfsTaskPayload, TaskHandler, TaskTarget, WorkerContext};
use crate::storage::dao::MirrorTokenDao;
use crate::storage::entities::MirrorTask;
use crate::throttle::RateLimiter;

pub const MAX_GROUP_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const MAX_GROUP_FILES: usize = 15;
pub const DOWNLOAD_ATTEMPTS: u32 = 3;

/// 按大小与数量上限切分；单个超过大小上限的对象独占一组
pub fn split_groups(pointers: Vec<LfsPointer>, max_bytes: u64, max_files: usize) -> Vec<Vec<LfsPointer>> {
    let mut groups = Vec::new();
    let mut current: Vec<LfsPointer> = Vec::new();
    let mut bytes = 0u64;
    for p in pointers {
        if !current.is_empty() && (current.len() >= max_files || bytes + p.size > max_bytes) {
            groups.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += p.size;
        current.push(p);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

pub struct LfsSyncWorker {
    ctx: WorkerContext,
    store: LfsStore,
    remote: Arc<dyn LfsRemote>,
    checkpoints: CheckpointStore,
    /// 镜像源没有配置带宽时使用，0 表示不限
    default_bandwidth: u64,
    retry_wait: Duration,
}

impl LfsSyncWorker {
    pub fn new(
        ctx: WorkerContext,
        store: LfsStore,
        remote: Arc<dyn LfsRemote>,
        checkpoints: CheckpointStore,
        default_bandwidth: u64,
    ) -> Self {
        Self {
            ctx,
            store,
            remote,
            checkpoints,
            default_bandwidth,
            retry_wait: Duration::from_secs(1),
        }
    }

    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    async fn bandwidth_limiter(&self, source_id: i64) -> Result<RateLimiter> {
        let ctx = &self.ctx;
        let limit = ctx
            .db
            .with_conn(|conn| {
                let Some(source) = crate::storage::dao::MirrorSourceDao::new(conn).get(source_id)? else {
                    return Ok(None);
                };
                Ok(MirrorTokenDao::new(conn)
                    .find_by_source(&source.source_name)?
                    .map(|t| t.max_bandwidth))
            })
            .await?
            .filter(|b| *b > 0)
            .map(|b| b as u64)
            .unwrap_or(self.default_bandwidth);
        Ok(RateLimiter::bandwidth(limit))
    }

    /// 进程退出返回 Interrupted，任务被新任务取代返回 Cancelled
    async fn check_stop(&self, task: &MirrorTask, cancel: &CancellationToken) -> Result<()> {
        self.ctx.ensure_not_interrupted(task, cancel)?;
        if self.ctx.task_status(task.id).await? == Some(TaskStatus::Cancelled) {
            return Err(HubSyncError::Cancelled(format!("任务 {} 已被取代", task.id)));
        }
        Ok(())
    }

    async fn download_one(&self, action: &LfsDownload, limiter: &RateLimiter) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let tmp = self.store.temp_path(&action.oid);
            let result = match self.remote.download(action, &tmp, limiter).await {
                Ok(_) => self.store.commit(&action.oid, &tmp).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    warn!(oid = %action.oid, attempt, "LFS 对象下载失败: {}", e);
                    last_err = Some(e);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(self.retry_wait * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| HubSyncError::Other(format!("下载 {} 失败", action.oid))))
    }

    async fn sync_lfs(&self, task: &mut MirrorTask, target: &TaskTarget, cancel: &CancellationToken) -> Result<()> {
        let ctx = &self.ctx;
        let TaskTarget { mirror, repo, .. } = target;
        ctx.update_mirror(mirror.id, mirror_status::LFS_SYNCING, task.progress, "").await;

        let payload = LfsTaskPayload::parse(&task.payload);
        let branch = if payload.branch.is_empty() {
            ctx.git.default_branch(repo).await?
        } else {
            payload.branch
        };
        let pointers = ctx.git.list_lfs_pointers(repo, &task.after_last_commit_id).await?;
        let total = pointers.len();

        let mut pending = Vec::new();
        for p in pointers {
            if self.checkpoints.is_done(mirror.id, &p.oid)? || self.store.contains(&p.oid).await? {
                continue;
            }
            pending.push(p);
        }
        let mut done = total - pending.len();
        info!(task_id = task.id, total, pending = pending.len(), "开始同步 LFS 对象");

        let req: MirrorSyncRequest = ctx.sync_request(mirror).await?;
        let limiter = self.bandwidth_limiter(mirror.mirror_source_id).await?;

        for group in split_groups(pending, MAX_GROUP_BYTES, MAX_GROUP_FILES) {
            let actions: HashMap<String, LfsDownload> = self
                .remote
                .batch(&req, &group)
                .await?
                .into_iter()
                .map(|a| (a.oid.clone(), a))
                .collect();

            for pointer in &group {
                self.check_stop(task, cancel).await?;
                let action = actions.get(&pointer.oid).ok_or_else(|| HubSyncError::Http {
                    status: 404,
                    message: format!("上游没有返回 LFS 对象 {} 的下载地址", pointer.oid),
                })?;
                self.download_one(action, &limiter).await?;
                self.checkpoints.mark_done(mirror.id, pointer)?;

                done += 1;
                task.progress = (done * 100 / total.max(1)) as i64;
                ctx.save_progress(task).await?;
                debug!(task_id = task.id, oid = %pointer.oid, progress = task.progress, "LFS 对象已落地");
            }
        }

        let head = ctx.git.branch_head(repo, &branch).await?;
        if !task.after_last_commit_id.is_empty() && head.as_deref() != Some(task.after_last_commit_id.as_str()) {
            ctx.git.set_branch(repo, &branch, &task.after_last_commit_id).await?;
        }
        task.progress = 100;
        ctx.transition(task, TaskEvent::Success).await?;
        if let Err(e) = self.checkpoints.clear(mirror.id) {
            warn!(mirror_id = mirror.id, "清理 LFS 断点失败: {}", e);
        }

        info!(task_id = task.id, repo = %repo, objects = total, "✅ LFS 同步完成");
        ctx.update_mirror(mirror.id, mirror_status::FINISHED, 100, "").await;
        ctx.notifier
            .notify(
                false,
                SCENARIO_REPO_SYNC_FINISHED,
                mirror,
                format!("同步完成 {}", mirror.local_repo_path),
                task.after_last_commit_id.clone(),
            )
            .await;
        ctx.notifier.task_finished(task, mirror).await;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for LfsSyncWorker {
    fn name(&self) -> &'static str {
        "lfs-sync"
    }

    fn dequeue_statuses(&self) -> &'static [TaskStatus] {
        &[TaskStatus::RepoSynced]
    }

    async fn handle_task(&self, mut task: MirrorTask, cancel: CancellationToken) -> Result<()> {
        let Some(mirror) = self.ctx.load_mirror(task.mirror_id).await? else {
            let err = HubSyncError::NotFound(format!("镜像 {} 不存在", task.mirror_id));
            return self.ctx.fail_missing(&mut task, err).await;
        };
        let target = match self.ctx.load_target(&mirror).await {
            Ok(t) => t,
            Err(e) => return self.ctx.fail_missing(&mut task, e).await,
        };

        match self.sync_lfs(&mut task, &target, &cancel).await {
            Ok(()) => Ok(()),
            Err(HubSyncError::Interrupted(msg)) => {
                info!(task_id = task.id, "LFS 同步被打断: {}", msg);
                self.ctx.release_interrupted(&mut task, mirror.id).await
            }
            Err(HubSyncError::Cancelled(msg)) => {
                info!(task_id = task.id, "LFS 同步中止: {}", msg);
                if let Err(e) = self.ctx.transition(&mut task, TaskEvent::Cancel).await {
                    debug!(task_id = task.id, "任务已不在可取消状态: {}", e);
                }
                self.ctx
                    .update_mirror(mirror.id, mirror_status::CANCELLED, task.progress, "")
                    .await;
                Ok(())
            }
            Err(HubSyncError::InvalidTransition { from, .. }) if from == TaskStatus::Cancelled.as_str() => {
                info!(task_id = task.id, "任务在 LFS 同步期间被取消");
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .handle_failure(&mut task, &mirror, e, SCENARIO_LFS_SYNC_FAILED)
                    .await
            }
        }
    }
}
