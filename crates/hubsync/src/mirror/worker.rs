//! 两类镜像 worker 共用的依赖与失败处理

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::FeatureFlags;
use crate::error::{HubSyncError, Result};
use crate::mirror::events::TaskNotifier;
use crate::mirror::git::{GitServer, LfsPointer, MirrorSyncRequest, RepoRef};
use crate::mirror::retry_policy::{FailureReason, RetryPolicy};
use crate::mirror::task::{TaskEvent, TaskStatus};
use crate::storage::dao::{MirrorDao, MirrorSourceDao, MirrorTaskDao, RepositoryDao, SyncClientSettingDao};
use crate::storage::entities::{Mirror, MirrorTask, RepoType, Repository};
use crate::storage::Database;
use crate::utils::time::format_time;

/// 由 worker pool 驱动的任务处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// 从这些状态出队（应用 continue 事件）
    fn dequeue_statuses(&self) -> &'static [TaskStatus];

    /// 处理已出队的任务；任务级失败在内部落库，只有基础设施错误才返回 Err
    async fn handle_task(&self, task: MirrorTask, cancel: CancellationToken) -> Result<()>;
}

/// repo 阶段写入任务 payload 的 LFS 信息
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LfsTaskPayload {
    pub branch: String,
    #[serde(default)]
    pub lfs_objects: Vec<LfsPointer>,
}

impl LfsTaskPayload {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!("任务 payload 解析失败，忽略: {}", e);
            Self::default()
        })
    }
}

/// 镜像状态字符串
pub mod mirror_status {
    pub const RUNNING: &str = "running";
    pub const REPO_SYNCED: &str = "repo_synced";
    pub const LFS_SYNCING: &str = "lfs_syncing";
    pub const FINISHED: &str = "finished";
    pub const WAITING: &str = "waiting";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

/// 一个任务所需的镜像与本地仓库
#[derive(Debug, Clone)]
pub struct TaskTarget {
    pub mirror: Mirror,
    pub repository: Repository,
    pub repo: RepoRef,
}

#[derive(Clone)]
pub struct WorkerContext {
    pub db: Database,
    pub git: Arc<dyn GitServer>,
    pub notifier: TaskNotifier,
    pub retry: RetryPolicy,
    pub features: FeatureFlags,
    /// 源站对应的 mirror_sources.source_name
    pub origin_source_name: String,
}

impl WorkerContext {
    pub async fn load_mirror(&self, mirror_id: i64) -> Result<Option<Mirror>> {
        self.db.with_conn(|conn| MirrorDao::new(conn).get(mirror_id)).await
    }

    pub async fn load_target(&self, mirror: &Mirror) -> Result<TaskTarget> {
        let repository = self
            .db
            .with_conn(|conn| RepositoryDao::new(conn).get(mirror.repository_id))
            .await?
            .ok_or_else(|| HubSyncError::NotFound(format!("镜像 {} 的本地仓库不存在", mirror.id)))?;
        let repo_type: RepoType = repository.repository_type.parse()?;
        let repo = RepoRef::new(repo_type, repository.path.clone());
        Ok(TaskTarget {
            mirror: mirror.clone(),
            repository,
            repo,
        })
    }

    /// 源地址加镜像凭证；非 SaaS 且镜像源是源站时使用 sync_client_settings 中的 token
    pub async fn sync_request(&self, mirror: &Mirror) -> Result<MirrorSyncRequest> {
        let mut req = MirrorSyncRequest {
            source_url: mirror.source_url.clone(),
            username: mirror.username.clone(),
            access_token: mirror.access_token.clone(),
        };
        if self.features.saas {
            return Ok(req);
        }
        let (source_id, origin) = (mirror.mirror_source_id, self.origin_source_name.clone());
        let token = self
            .db
            .with_conn(move |conn| {
                let Some(source) = MirrorSourceDao::new(conn).get(source_id)? else {
                    return Ok(None);
                };
                if source.source_name != origin {
                    return Ok(None);
                }
                Ok(SyncClientSettingDao::new(conn).get()?.map(|s| s.token))
            })
            .await?;
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            req.access_token = token;
        }
        Ok(req)
    }

    pub async fn transition(&self, task: &mut MirrorTask, event: TaskEvent) -> Result<()> {
        self.db
            .with_conn(|conn| MirrorTaskDao::new(conn).transition(task, event))
            .await
    }

    pub async fn save_progress(&self, task: &MirrorTask) -> Result<()> {
        self.db.with_conn(|conn| MirrorTaskDao::new(conn).save_progress(task)).await
    }

    pub async fn task_status(&self, task_id: i64) -> Result<Option<TaskStatus>> {
        self.db.with_conn(|conn| MirrorTaskDao::new(conn).get_status(task_id)).await
    }

    pub async fn update_mirror(&self, mirror_id: i64, status: &str, progress: i64, message: &str) {
        let res = self
            .db
            .with_conn(|conn| MirrorDao::new(conn).update_status(mirror_id, status, progress, message))
            .await;
        if let Err(e) = res {
            warn!(mirror_id, "更新镜像状态失败: {}", e);
        }
    }

    /// 失败处理：可重试错误按退避重排，预算耗尽进入 fatal，其余进入 fail
    ///
    /// 任务在处理期间被取消时，状态迁移返回 from=cancelled，这里静默结束。
    pub async fn handle_failure(&self, task: &mut MirrorTask, mirror: &Mirror, err: HubSyncError, scenario: &str) -> Result<()> {
        let reason = FailureReason::from(&err);
        task.error_message = err.to_string();

        let event = if reason.is_retryable() {
            task.retry_count += 1;
            let retry_count = u32::try_from(task.retry_count).unwrap_or(u32::MAX);
            match self.retry.next_delay(retry_count, &reason) {
                Some(delay) => {
                    let at = chrono::Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300));
                    task.next_retry_at = Some(format_time(at));
                    TaskEvent::Retry
                }
                None => TaskEvent::Fatal,
            }
        } else {
            TaskEvent::Fail
        };

        match self.transition(task, event).await {
            Ok(()) => {}
            Err(HubSyncError::InvalidTransition { from, .. }) if from == TaskStatus::Cancelled.as_str() => {
                info!(task_id = task.id, "任务已被取消，放弃本次结果");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let retry_count = task.retry_count;
        if let Err(e) = self
            .db
            .with_conn(|conn| MirrorDao::new(conn).set_retry_count(mirror.id, retry_count))
            .await
        {
            warn!(mirror_id = mirror.id, "更新重试次数失败: {}", e);
        }

        if event == TaskEvent::Retry {
            warn!(
                task_id = task.id,
                retry_count = task.retry_count,
                next_retry_at = ?task.next_retry_at,
                "任务失败，等待重试: {}",
                task.error_message
            );
            self.update_mirror(mirror.id, mirror_status::WAITING, task.progress, &task.error_message)
                .await;
            return Ok(());
        }

        error!(task_id = task.id, status = %task.status, "任务失败: {}", task.error_message);
        self.update_mirror(mirror.id, mirror_status::FAILED, task.progress, &task.error_message)
            .await;
        self.notifier
            .notify(
                true,
                scenario,
                mirror,
                format!("镜像同步失败: {}", mirror.local_repo_path),
                task.error_message.clone(),
            )
            .await;
        self.notifier.task_failed(task, mirror).await;
        Ok(())
    }

    /// 进程正在退出时返回 Interrupted，供 worker 在两步之间检查
    pub fn ensure_not_interrupted(&self, task: &MirrorTask, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(HubSyncError::Interrupted(format!("任务 {} 被进程退出打断", task.id)));
        }
        Ok(())
    }

    /// 被进程退出打断的任务退回出队前的状态：running 回到 queued，lfs_start 回到 repo_synced
    ///
    /// 不计入重试次数，下一个 pool 可以立即取走。
    pub async fn release_interrupted(&self, task: &mut MirrorTask, mirror_id: i64) -> Result<()> {
        task.started_at = None;
        task.next_retry_at = None;
        match self.transition(task, TaskEvent::Retry).await {
            Ok(()) => {}
            Err(HubSyncError::InvalidTransition { from, .. }) if from == TaskStatus::Cancelled.as_str() => {
                info!(task_id = task.id, "任务已被取消，无需退回");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let status = if task.status == TaskStatus::RepoSynced {
            mirror_status::REPO_SYNCED
        } else {
            mirror_status::WAITING
        };
        info!(task_id = task.id, status = %task.status, "进程退出，任务已退回");
        self.update_mirror(mirror_id, status, task.progress, "").await;
        Ok(())
    }

    /// 镜像或仓库记录缺失：直接 fail
    pub async fn fail_missing(&self, task: &mut MirrorTask, err: HubSyncError) -> Result<()> {
        error!(task_id = task.id, mirror_id = task.mirror_id, "任务无法执行: {}", err);
        task.error_message = err.to_string();
        match self.transition(task, TaskEvent::Fail).await {
            Err(HubSyncError::InvalidTransition { .. }) => Ok(()),
            other => other,
        }
    }
}
