//! 仓库（git）同步 worker：处理 queued 任务
//!
//! 进程退出只在 `mirror_sync` 之前检查；fetch 之后分支可能已指向新提交，必须走完 LFS 暂存步骤。

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{HubSyncError, Result};
use crate::mirror::events::{SCENARIO_REPO_SYNC_FAILED, SCENARIO_REPO_SYNC_FINISHED, SCENARIO_REPO_SYNC_START};
use crate::mirror::task::{TaskEvent, TaskStatus};
use crate::mirror::worker::{mirror_status, LfsTaskPayload, TaskHandler, TaskTarget, WorkerContext};
use crate::storage::entities::MirrorTask;

pub struct RepoSyncWorker {
    ctx: WorkerContext,
}

impl RepoSyncWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// 执行 git 同步；成功时任务已迁移到 finished 或 repo_synced
    async fn sync_repo(&self, task: &mut MirrorTask, target: &TaskTarget, cancel: &CancellationToken) -> Result<()> {
        let ctx = &self.ctx;
        let TaskTarget { mirror, repository, repo } = target;

        ctx.notifier
            .notify(
                false,
                SCENARIO_REPO_SYNC_START,
                mirror,
                format!("开始同步 {}", mirror.local_repo_path),
                mirror.source_url.clone(),
            )
            .await;
        ctx.update_mirror(mirror.id, mirror_status::RUNNING, 0, "").await;

        ctx.git.ensure_repo(repo).await?;

        let old_branch = if repository.default_branch.is_empty() {
            "main"
        } else {
            repository.default_branch.as_str()
        };
        task.before_last_commit_id = ctx.git.branch_head(repo, old_branch).await?.unwrap_or_default();

        let req = ctx.sync_request(mirror).await?;
        ctx.ensure_not_interrupted(task, cancel)?;
        ctx.git.check_source(&req).await?;
        ctx.ensure_not_interrupted(task, cancel)?;
        ctx.git.mirror_sync(repo, &req).await?;

        let branch = ctx.git.default_branch(repo).await?;
        let pointers = ctx.git.list_lfs_pointers(repo, &branch).await?;
        task.after_last_commit_id = ctx.git.branch_head(repo, &branch).await?.unwrap_or_default();
        debug!(
            task_id = task.id,
            before = %task.before_last_commit_id,
            after = %task.after_last_commit_id,
            lfs = pointers.len(),
            "git 同步完成"
        );

        if pointers.is_empty() || !mirror.sync_lfs {
            task.progress = 100;
            ctx.transition(task, TaskEvent::NoLfs).await?;
            info!(task_id = task.id, repo = %repo, "✅ 镜像同步完成（无 LFS）");
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
            return Ok(());
        }

        // LFS 全部落地前不让用户看到新提交
        if !task.before_last_commit_id.is_empty() && task.before_last_commit_id != task.after_last_commit_id {
            ctx.git.set_branch(repo, &branch, &task.before_last_commit_id).await?;
        }
        let payload = LfsTaskPayload {
            branch,
            lfs_objects: pointers,
        };
        task.payload = serde_json::to_string(&payload)?;
        task.progress = 0;
        ctx.transition(task, TaskEvent::Success).await?;
        info!(task_id = task.id, repo = %repo, lfs = payload.lfs_objects.len(), "仓库已同步，等待 LFS");
        ctx.update_mirror(mirror.id, mirror_status::REPO_SYNCED, 0, "").await;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for RepoSyncWorker {
    fn name(&self) -> &'static str {
        "repo-sync"
    }

    fn dequeue_statuses(&self) -> &'static [TaskStatus] {
        &[TaskStatus::Queued]
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

        match self.sync_repo(&mut task, &target, &cancel).await {
            Ok(()) => Ok(()),
            Err(HubSyncError::Interrupted(msg)) => {
                info!(task_id = task.id, "仓库同步被打断: {}", msg);
                self.ctx.release_interrupted(&mut task, mirror.id).await
            }
            Err(HubSyncError::InvalidTransition { from, .. }) if from == TaskStatus::Cancelled.as_str() => {
                info!(task_id = task.id, "任务在同步期间被取消");
                self.ctx
                    .update_mirror(mirror.id, mirror_status::CANCELLED, task.progress, "")
                    .await;
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .handle_failure(&mut task, &mirror, e, SCENARIO_REPO_SYNC_FAILED)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::git::{LfsPointer, RepoRef, UpstreamRepo};
    use crate::mirror::worker::fixtures::*;
    use crate::storage::entities::RepoType;

    fn upstream(head: &str, lfs: Vec<LfsPointer>) -> UpstreamRepo {
        UpstreamRepo {
            default_branch: "main".into(),
            head: head.into(),
            lfs,
        }
    }

    #[tokio::test]
    async fn test_repo_without_lfs_finishes() {
        let h = harness();
        let (mirror, id) = mirror_with_task(&h.db, "ns/a", true).await;
        h.git.set_upstream(&mirror.source_url, upstream("c1", vec![]));

        let worker = RepoSyncWorker::new(h.ctx.clone());
        let task = dequeue(&h.db, worker.dequeue_statuses()).await.unwrap();
        tokio_test::assert_ok!(worker.handle_task(task, CancellationToken::new()).await);

        let task = crate::mirror::worker::fixtures::task(&h.db, id).await;
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(task.progress, 100);
        assert_eq!(task.after_last_commit_id, "c1");
        assert!(task.finished_at.is_some());
        let events = h.bus.stream_messages("mirrorTaskEventStream");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "mirror.task.finished");
    }

    #[tokio::test]
    async fn test_lfs_repo_holds_branch_at_previous_commit() {
        let h = harness();
        let (mirror, id) = mirror_with_task(&h.db, "ns/a", true).await;
        let repo = RepoRef::new(RepoType::Model, "ns/a");
        let ptr = LfsPointer { oid: "ab01".into(), size: 10, path: "w.bin".into() };

        // 第一次同步：没有旧提交，分支直接指向 c1
        h.git.set_upstream(&mirror.source_url, upstream("c1", vec![ptr.clone()]));
        let worker = RepoSyncWorker::new(h.ctx.clone());
        let task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        worker.handle_task(task, CancellationToken::new()).await.unwrap();
        let first = crate::mirror::worker::fixtures::task(&h.db, id).await;
        assert_eq!(first.status, TaskStatus::RepoSynced);
        let payload = LfsTaskPayload::parse(&first.payload);
        assert_eq!(payload.branch, "main");
        assert_eq!(payload.lfs_objects, vec![ptr.clone()]);

        // 第二次同步：上游前进到 c2，分支被拉回 c1 等待 LFS
        h.git.set_upstream(&mirror.source_url, upstream("c2", vec![ptr]));
        let second_id = h
            .db
            .with_conn(|conn| {
                crate::storage::dao::MirrorTaskDao::new(conn).create_task_cancelling_others(mirror.id, 1, "")
            })
            .await
            .unwrap()
            .id;
        let task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        assert_eq!(task.id, second_id);
        worker.handle_task(task, CancellationToken::new()).await.unwrap();
        let second = crate::mirror::worker::fixtures::task(&h.db, second_id).await;
        assert_eq!(second.before_last_commit_id, "c1");
        assert_eq!(second.after_last_commit_id, "c2");
        assert_eq!(h.git.head(&repo, "main").as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_deleted_upstream_is_permanent() {
        let h = harness();
        let (_mirror, id) = mirror_with_task(&h.db, "ns/gone", false).await;
        let worker = RepoSyncWorker::new(h.ctx.clone());
        let task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        worker.handle_task(task, CancellationToken::new()).await.unwrap();

        let task = crate::mirror::worker::fixtures::task(&h.db, id).await;
        assert_eq!(task.status, TaskStatus::RepoFailed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error_message.contains("ns/gone"));
        let events = h.bus.stream_messages("mirrorTaskEventStream");
        assert_eq!(events[0].0, "mirror.task.failed");
    }

    #[tokio::test]
    async fn test_transient_git_error_schedules_retry() {
        let h = harness();
        let (mirror, id) = mirror_with_task(&h.db, "ns/a", false).await;
        h.git.set_upstream(&mirror.source_url, upstream("c1", vec![]));
        h.git.fail_next_sync(&mirror.source_url, HubSyncError::Timeout("git fetch".into()));

        let worker = RepoSyncWorker::new(h.ctx.clone());
        let task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        worker.handle_task(task, CancellationToken::new()).await.unwrap();
        let task = crate::mirror::worker::fixtures::task(&h.db, id).await;
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);

        // 退避时间为 0，立即可以再次出队并成功
        let task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        worker.handle_task(task, CancellationToken::new()).await.unwrap();
        assert_eq!(crate::mirror::worker::fixtures::task(&h.db, id).await.status, TaskStatus::Finished);
        assert_eq!(h.git.sync_calls(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_before_fetch_requeues_task() {
        let h = harness();
        let (mirror, id) = mirror_with_task(&h.db, "ns/a", false).await;
        h.git.set_upstream(&mirror.source_url, upstream("c1", vec![]));

        let worker = RepoSyncWorker::new(h.ctx.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        worker.handle_task(task, cancel).await.unwrap();

        let task = crate::mirror::worker::fixtures::task(&h.db, id).await;
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
        assert_eq!(h.git.sync_calls(), 0);
        assert!(h.bus.stream_messages("mirrorTaskEventStream").is_empty());
    }
}
