//! 镜像任务状态机
//!
//! ```text
//! queued --continue--> running --success--> repo_synced --continue--> lfs_start --success--> finished
//!                      running --no_lfs--> finished
//! ```
//!
//! repo 阶段失败进入 `repo_failed`，retry 回到 `queued`；LFS 阶段失败进入 `failed`，retry 回到 `repo_synced`。
//! retry 预算耗尽后走 fatal：repo 阶段进入 `repo_fatal`，LFS 阶段进入 `fatal`。
//! 任意非终态都可以 cancel。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HubSyncError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    RepoSynced,
    LfsStart,
    Finished,
    RepoFailed,
    Failed,
    RepoFatal,
    Fatal,
    Cancelled,
}

/// 对外暴露的粗粒度阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    Continue,
    Success,
    NoLfs,
    Fail,
    Retry,
    Fatal,
    Cancel,
}

impl TaskStatus {
    /// 同一镜像同时最多只能有一个任务处于这些状态
    pub const ACTIVE: [TaskStatus; 3] = [
        TaskStatus::Running,
        TaskStatus::RepoSynced,
        TaskStatus::LfsStart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::RepoSynced => "repo_synced",
            TaskStatus::LfsStart => "lfs_start",
            TaskStatus::Finished => "finished",
            TaskStatus::RepoFailed => "repo_failed",
            TaskStatus::Failed => "failed",
            TaskStatus::RepoFatal => "repo_fatal",
            TaskStatus::Fatal => "fatal",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// 不再接受任何事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::RepoFatal | TaskStatus::Fatal | TaskStatus::Cancelled
        )
    }

    /// 失败类状态（含 fatal），resync 时会为其重建任务
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::RepoFailed | TaskStatus::Failed | TaskStatus::RepoFatal | TaskStatus::Fatal
        )
    }

    pub fn phase(&self) -> TaskPhase {
        match self {
            TaskStatus::Queued => TaskPhase::Queued,
            TaskStatus::Running | TaskStatus::RepoSynced | TaskStatus::LfsStart => TaskPhase::Running,
            TaskStatus::Finished => TaskPhase::Finished,
            TaskStatus::RepoFailed | TaskStatus::Failed | TaskStatus::RepoFatal | TaskStatus::Fatal => {
                TaskPhase::Failed
            }
            TaskStatus::Cancelled => TaskPhase::Cancelled,
        }
    }

    /// 对当前状态应用事件，非法组合返回 InvalidTransition
    pub fn transition(self, event: TaskEvent) -> Result<TaskStatus> {
        use TaskEvent as E;
        use TaskStatus as S;

        let next = match (self, event) {
            (S::Queued, E::Continue) => S::Running,
            (S::RepoSynced, E::Continue) => S::LfsStart,

            (S::Running, E::Success) => S::RepoSynced,
            (S::LfsStart, E::Success) => S::Finished,

            (S::Running, E::NoLfs) => S::Finished,

            (S::Running, E::Fail) => S::RepoFailed,
            (S::LfsStart, E::Fail) => S::Failed,

            (S::Running | S::RepoFailed, E::Retry) => S::Queued,
            (S::LfsStart | S::Failed, E::Retry) => S::RepoSynced,

            (S::Running | S::RepoFailed, E::Fatal) => S::RepoFatal,
            (S::LfsStart | S::Failed, E::Fatal) => S::Fatal,

            (s, E::Cancel) if !s.is_terminal() => S::Cancelled,

            (from, event) => {
                return Err(HubSyncError::InvalidTransition {
                    from: from.as_str().to_string(),
                    event: event.as_str().to_string(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = HubSyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let status = match s {
            "queued" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "repo_synced" => TaskStatus::RepoSynced,
            "lfs_start" => TaskStatus::LfsStart,
            "finished" => TaskStatus::Finished,
            "repo_failed" => TaskStatus::RepoFailed,
            "failed" => TaskStatus::Failed,
            "repo_fatal" => TaskStatus::RepoFatal,
            "fatal" => TaskStatus::Fatal,
            "cancelled" => TaskStatus::Cancelled,
            other => return Err(HubSyncError::InvalidData(format!("未知任务状态: {}", other))),
        };
        Ok(status)
    }
}

impl TaskEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEvent::Continue => "continue",
            TaskEvent::Success => "success",
            TaskEvent::NoLfs => "no_lfs",
            TaskEvent::Fail => "fail",
            TaskEvent::Retry => "retry",
            TaskEvent::Fatal => "fatal",
            TaskEvent::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
