//! 运行时依赖装配
//!
//! 启动时按层构造一次：存储 → 锁 → 消息总线 → 配额，之后以引用或 `Arc` 注入各组件。
//! 没有全局单例，测试用 `from_parts` 直接传入内存实现。

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::bus::MessageBus;
use crate::config::{HubConfig, LockBackend};
use crate::error::Result;
use crate::lock::{DistributedLock, LockOptions, MemoryLock, MemoryLockTable, RedisLock};
use crate::mirror::events::TaskNotifier;
use crate::mirror::git::{GitCliServer, GitServer};
use crate::mirror::import::MirrorImporter;
use crate::mirror::lfs::{CheckpointStore, HttpLfsRemote, LfsStore};
use crate::mirror::lfs_worker::LfsSyncWorker;
use crate::mirror::pool::{PoolConfig, WorkerPool};
use crate::mirror::reconcile::MirrorReconciler;
use crate::mirror::repo_worker::RepoSyncWorker;
use crate::mirror::retry_policy::RetryPolicy;
use crate::mirror::worker::WorkerContext;
use crate::quota::{HttpQuotaClient, QuotaGate};
use crate::storage::dao::SyncClientSettingDao;
use crate::storage::kv::KvStore;
use crate::storage::Database;
use crate::sync::{HttpSyncClient, RepoFilter, SyncEngine, SyncVersionCleaner};

pub struct HubServices {
    config: HubConfig,
    db: Database,
    kv: KvStore,
    bus: Arc<MessageBus>,
    lock: Arc<dyn DistributedLock>,
    quota: QuotaGate,
}

impl HubServices {
    /// 校验配置并连接所有后端；任何一步失败都是致命错误
    pub async fn initialize(config: HubConfig) -> Result<Self> {
        info!("正在初始化 hubsync 服务...");
        config.validate()?;

        // === 存储 ===
        let db = Database::open(&config.storage.db_path, config.storage.busy_timeout_ms).await?;
        let kv = KvStore::new(&config.storage.kv_path).await?;

        // === 分布式锁 ===
        let lock: Arc<dyn DistributedLock> = match config.lock.backend {
            LockBackend::Redis => Arc::new(RedisLock::connect(&config.lock).await?),
            LockBackend::Memory => Arc::new(MemoryLock::new(
                MemoryLockTable::default(),
                LockOptions::from(&config.lock),
            )),
        };
        info!("分布式锁后端: {:?}, holder={}", config.lock.backend, lock.holder_id());

        // === 消息总线 ===
        let bus = Arc::new(MessageBus::connect(&config.bus).await?);
        info!("消息总线后端: {}", bus.backend_name());

        // === 配额 ===
        let quota = if config.accounting.enabled {
            QuotaGate::new(Arc::new(HttpQuotaClient::new(&config.accounting, &config.http)?))
        } else {
            QuotaGate::disabled()
        };

        info!("✅ hubsync 服务初始化完成");
        Ok(Self::from_parts(config, db, kv, bus, lock, quota))
    }

    pub fn from_parts(
        config: HubConfig,
        db: Database,
        kv: KvStore,
        bus: Arc<MessageBus>,
        lock: Arc<dyn DistributedLock>,
        quota: QuotaGate,
    ) -> Self {
        Self {
            config,
            db,
            kv,
            bus,
            lock,
            quota,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    pub fn lock(&self) -> Arc<dyn DistributedLock> {
        self.lock.clone()
    }

    pub fn git_server(&self) -> Result<Arc<dyn GitServer>> {
        Ok(Arc::new(GitCliServer::new(&self.config.mirror, &self.config.http)?))
    }

    pub fn worker_context(&self, git: Arc<dyn GitServer>) -> WorkerContext {
        WorkerContext {
            db: self.db.clone(),
            git,
            notifier: TaskNotifier::new(self.bus.clone()),
            retry: RetryPolicy::with_max_retries(self.config.mirror.max_retries),
            features: self.config.features.clone(),
            origin_source_name: self.config.mirror.origin_source_name.clone(),
        }
    }

    pub fn repo_pool(&self, ctx: WorkerContext) -> WorkerPool {
        WorkerPool::new(
            self.db.clone(),
            Arc::new(RepoSyncWorker::new(ctx)),
            PoolConfig::repo(&self.config.mirror),
        )
    }

    pub fn lfs_pool(&self, ctx: WorkerContext) -> Result<WorkerPool> {
        let worker = LfsSyncWorker::new(
            ctx,
            LfsStore::new(&self.config.mirror.lfs_root),
            Arc::new(HttpLfsRemote::new(&self.config.http)?),
            CheckpointStore::new(self.kv.clone()),
            self.config.mirror.lfs_max_bandwidth,
        );
        Ok(WorkerPool::new(
            self.db.clone(),
            Arc::new(worker),
            PoolConfig::lfs(&self.config.mirror),
        ))
    }

    pub fn reconciler(&self, ctx: WorkerContext) -> MirrorReconciler {
        MirrorReconciler::new(ctx, self.lock.clone())
            .with_task_lease(Duration::from_secs(self.config.mirror.task_lease_secs))
    }

    pub fn importer(&self) -> MirrorImporter {
        MirrorImporter::new(self.db.clone())
    }

    /// 源站 token 优先取 sync_client_settings，没有时用配置
    pub async fn sync_engine(&self) -> Result<SyncEngine> {
        let setting = self.db.with_conn(|conn| SyncClientSettingDao::new(conn).get()).await?;
        let token = setting
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.config.sync.token.clone());
        let client = HttpSyncClient::new(&self.config.sync.origin_endpoint, &token, &self.config.http)?;
        Ok(SyncEngine::new(
            self.db.clone(),
            Arc::new(client),
            self.quota.clone(),
            self.config.sync.clone(),
            self.config.accounting.current_user.clone(),
        ))
    }

    pub fn cleaner(&self) -> Result<SyncVersionCleaner> {
        let filter = RepoFilter::new(&self.config.sync.filter.namespaces)?;
        Ok(SyncVersionCleaner::new(self.db.clone(), filter))
    }

    /// 刷盘，进程退出前调用
    pub async fn shutdown(&self) -> Result<()> {
        self.kv.flush().await?;
        info!("hubsync 服务已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusBackend;
    use crate::mirror::task::TaskStatus;
    use crate::storage::dao::MirrorTaskDao;
    use std::io::Write;

    fn memory_config(dir: &std::path::Path) -> HubConfig {
        let mut config = HubConfig::default();
        config.storage.db_path = dir.join("hub.db");
        config.storage.kv_path = dir.to_path_buf();
        config.lock.backend = LockBackend::Memory;
        config.bus.backend = BusBackend::Memory;
        config.mirror.repos_root = dir.join("repos");
        config.mirror.lfs_root = dir.join("lfs");
        config
    }

    #[tokio::test]
    async fn test_initialize_with_memory_backends() {
        let dir = tempfile::tempdir().unwrap();
        let services = HubServices::initialize(memory_config(dir.path())).await.unwrap();
        assert_eq!(services.bus().backend_name(), "memory");
        assert!(services.db().path().is_some());

        let mut csv = std::fs::File::create(dir.path().join("mirrors.csv")).unwrap();
        writeln!(csv, "repo_type,repo_path").unwrap();
        writeln!(csv, "model,ns/m").unwrap();
        let report = services
            .importer()
            .import_csv(dir.path().join("mirrors.csv"), false)
            .await
            .unwrap();
        assert_eq!(report.created, 1);

        let queued = services
            .db()
            .with_conn(|conn| MirrorTaskDao::new(conn).list_by_status(&[TaskStatus::Queued]))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);

        let git = services.git_server().unwrap();
        let reconciler = services.reconciler(services.worker_context(git));
        let progress = reconciler.check_mirror_progress(false).await.unwrap().unwrap();
        assert_eq!(progress.scanned, 1);
        services.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config(dir.path());
        config.features.push_mirror = true;
        let err = HubServices::initialize(config).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::FatalConfig);
    }
}
