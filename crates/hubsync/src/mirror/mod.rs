//! 镜像子系统
//!
//! 从第三方 git 托管（如 HuggingFace）或源站拉取仓库到本地：
//! - `task`：任务状态机，`priority` / `retry_policy`：出队顺序与退避
//! - `repo_worker` / `lfs_worker`：两阶段同步，由 `pool` 驱动
//! - `reconcile`：分布式锁下的周期性对账
//! - `import`：CSV 批量建镜像

pub mod events;
pub mod git;
pub mod import;
pub mod lfs;
pub mod lfs_worker;
pub mod pool;
pub mod priority;
pub mod reconcile;
pub mod repo_worker;
pub mod retry_policy;
pub mod task;
pub mod worker;

pub use events::{MirrorTaskEvent, NotificationMessage, TaskNotifier};
pub use git::{GitCliServer, GitServer, LfsPointer, MemoryGitServer, MirrorSyncRequest, RepoRef};
pub use import::{ImportReport, MirrorImporter};
pub use lfs::{CheckpointStore, HttpLfsRemote, LfsRemote, LfsStore, MemoryLfsRemote};
pub use lfs_worker::LfsSyncWorker;
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use priority::MirrorPriority;
pub use reconcile::{MirrorReconciler, ProgressReport, PushMirrorReport};
pub use repo_worker::RepoSyncWorker;
pub use retry_policy::{FailureReason, RetryPolicy};
pub use task::{TaskEvent, TaskPhase, TaskStatus};
pub use worker::{TaskHandler, WorkerContext};
