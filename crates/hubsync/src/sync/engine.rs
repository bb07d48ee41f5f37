//! 下游拉取同步的一个周期
//!
//! 先把源站的新版本原样记到本地账本（游标推进），再逐个物化未完成的仓库。
//! 物化失败的条目保持未完成，下一个周期重试；重复物化是幂等的。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{HubSyncError, Result};
use crate::quota::{QuotaDecision, QuotaGate};
use crate::storage::dao::repository::RepositoryDao;
use crate::storage::dao::sync_version::SyncVersionDao;
use crate::storage::dao::TransactionManager;
use crate::storage::entities::{RepoType, RepositoryUpsert, SyncVersion};
use crate::storage::Database;
use crate::sync::client::SyncClient;
use crate::sync::types::{local_repo_path, split_repo_path, RepoSnapshot};

/// 同步到本地的仓库来源标记
pub const SYNC_REPO_SOURCE: &str = "opencsg";
/// 新同步仓库的状态
pub const SYNC_STATUS_PENDING: &str = "pending";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// 新记录到本地账本的版本数
    pub fetched: usize,
    pub materialized: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub cursor: i64,
}

pub struct SyncEngine {
    db: Database,
    client: Arc<dyn SyncClient>,
    quota: QuotaGate,
    config: SyncConfig,
    current_user: String,
}

enum Outcome {
    Materialized,
    Skipped,
    Rejected,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        client: Arc<dyn SyncClient>,
        quota: QuotaGate,
        config: SyncConfig,
        current_user: impl Into<String>,
    ) -> Self {
        Self {
            db,
            client,
            quota,
            config,
            current_user: current_user.into(),
        }
    }

    pub async fn sync_as_client(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if !self.config.multi_sync_enabled {
            debug!("未开启多实例同步，跳过");
            return Ok(report);
        }

        let start = self
            .db
            .with_conn(|conn| SyncVersionDao::new(conn).get_latest_version())
            .await?;
        let (cursor, fetched) = self.pull_versions(start).await?;
        report.cursor = cursor;
        report.fetched = fetched;

        let pending = self
            .db
            .with_conn(|conn| SyncVersionDao::new(conn).find_not_completed_distinct())
            .await?;
        info!("拉取完成: cursor={} 新版本={} 待物化={}", cursor, fetched, pending.len());

        for v in &pending {
            match self.materialize(v).await {
                Outcome::Materialized => report.materialized += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Rejected => report.rejected += 1,
            }
        }

        info!(
            "✅ 同步周期结束: cursor={} fetched={} materialized={} skipped={} rejected={}",
            report.cursor, report.fetched, report.materialized, report.skipped, report.rejected
        );
        Ok(report)
    }

    /// 从 cur 开始把所有新版本记到本地，返回 (新游标, 新插入条数)
    async fn pull_versions(&self, mut cur: i64) -> Result<(i64, usize)> {
        let timeout = Duration::from_secs(self.config.latest_timeout_secs);
        let mut fetched = 0;
        loop {
            let resp = tokio::time::timeout(timeout, self.client.latest(cur))
                .await
                .map_err(|_| HubSyncError::Timeout(format!("拉取最新版本超时 cur={}", cur)))??;

            let versions = resp.versions.clone();
            fetched += self
                .db
                .with_conn(move |conn| {
                    let dao = SyncVersionDao::new(conn);
                    let mut inserted = 0;
                    for v in &versions {
                        match dao.insert_with_version(v) {
                            Ok(true) => inserted += 1,
                            Ok(false) => {}
                            Err(e) => warn!(version = v.version, "记录版本失败，跳过: {}", e),
                        }
                    }
                    Ok(inserted)
                })
                .await?;

            let next = resp.next_cursor(cur);
            debug!(from = cur, to = next, has_more = resp.has_more, "拉取一批版本");
            if next <= cur && resp.has_more {
                warn!("源站返回 has_more 但游标未前进，停止拉取: cur={}", cur);
                break;
            }
            cur = next;
            if !resp.has_more {
                break;
            }
        }
        Ok((cur, fetched))
    }

    async fn materialize(&self, v: &SyncVersion) -> Outcome {
        let repo_type: RepoType = match v.repo_type.parse() {
            Ok(t) => t,
            Err(e) => {
                warn!(version = v.version, "未知仓库类型，跳过: {}", e);
                return Outcome::Skipped;
            }
        };

        match self.quota.admit(&self.current_user, repo_type, &v.repo_path).await {
            Ok(QuotaDecision::Admit { .. }) => {}
            Ok(QuotaDecision::Reject(reason)) => {
                warn!(repo = %v.repo_path, "配额不足，不同步: {}", reason);
                return Outcome::Rejected;
            }
            Err(e) => {
                warn!(repo = %v.repo_path, "配额检查失败，跳过: {}", e);
                return Outcome::Skipped;
            }
        }

        let snapshot = match self.fetch(repo_type, v).await {
            Ok(s) => s,
            Err(e) => {
                warn!(repo = %v.repo_path, version = v.version, "获取仓库内容失败，下轮重试: {}", e);
                return Outcome::Skipped;
            }
        };

        if let Err(e) = self.apply(repo_type, v, snapshot).await {
            warn!(repo = %v.repo_path, version = v.version, "写入本地仓库失败，下轮重试: {}", e);
            return Outcome::Skipped;
        }

        if let Err(e) = self.quota.record(&self.current_user, repo_type, &v.repo_path).await {
            warn!(repo = %v.repo_path, "记录下载失败: {}", e);
        }
        Outcome::Materialized
    }

    async fn fetch(&self, repo_type: RepoType, v: &SyncVersion) -> Result<RepoSnapshot> {
        let timeout = Duration::from_secs(self.config.info_timeout_secs);
        let info = tokio::time::timeout(timeout, self.client.info(repo_type, v))
            .await
            .map_err(|_| HubSyncError::Timeout(format!("获取仓库信息超时: {}", v.repo_path)))??;

        let readme = match self.client.readme(v).await {
            Ok(r) => r,
            Err(e) => {
                debug!(repo = %v.repo_path, "获取 README 失败，置空: {}", e);
                String::new()
            }
        };
        let files = self.client.file_list(v).await?;
        Ok(RepoSnapshot { info, readme, files })
    }

    /// 写仓库、文件、标签并把同一仓库的旧版本一起标记完成，在一个事务内
    async fn apply(&self, repo_type: RepoType, v: &SyncVersion, snapshot: RepoSnapshot) -> Result<i64> {
        let (_, name) = split_repo_path(&v.repo_path)?;
        let local_path = local_repo_path(v.source_id, &v.repo_path);
        let info = snapshot.info;
        let upsert = RepositoryUpsert {
            repository_type: repo_type.as_str().to_string(),
            path: local_path,
            name: name.to_string(),
            nickname: info.nickname,
            description: info.description,
            license: info.license,
            private: info.private,
            default_branch: if info.default_branch.is_empty() {
                "main".to_string()
            } else {
                info.default_branch
            },
            source: SYNC_REPO_SOURCE.to_string(),
            sync_status: SYNC_STATUS_PENDING.to_string(),
            readme: snapshot.readme,
            downloads: info.downloads,
            likes: info.likes,
        };
        let files = snapshot.files;
        let tags = info.tags;
        let v = v.clone();

        self.db
            .with_conn(move |conn| {
                TransactionManager::new(conn).execute(|tx| {
                    let repos = RepositoryDao::new(tx);
                    let id = repos.upsert(&upsert)?;
                    repos.replace_files(id, &files)?;
                    repos.replace_tags(id, &tags)?;
                    SyncVersionDao::new(tx).complete(&v)?;
                    Ok(id)
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{MemoryQuotaClient, QuotaInfo};
    use crate::storage::entities::{RepoFile, RepoTag};
    use crate::sync::client::LedgerSyncClient;
    use crate::sync::ledger::SyncVersionLedger;
    use crate::sync::types::{LatestResponse, RepoInfo};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    struct Origin {
        db: Database,
        ledger: SyncVersionLedger,
    }

    impl Origin {
        fn new(source_id: i64) -> Self {
            let db = Database::open_in_memory().unwrap();
            Self { ledger: SyncVersionLedger::new(db.clone(), source_id), db }
        }

        async fn write(&self, path: &str, repo_type: RepoType, readme: &str) -> SyncVersion {
            let (path_owned, readme_owned) = (path.to_string(), readme.to_string());
            self.db
                .with_conn(move |conn| {
                    let dao = RepositoryDao::new(conn);
                    let id = dao.upsert(&RepositoryUpsert {
                        repository_type: repo_type.as_str().into(),
                        path: path_owned.clone(),
                        name: path_owned.rsplit('/').next().unwrap().into(),
                        readme: readme_owned.clone(),
                        default_branch: "main".into(),
                        ..Default::default()
                    })?;
                    dao.replace_files(
                        id,
                        &[RepoFile { path: format!("{}.bin", readme_owned), name: "f".into(), ..Default::default() }],
                    )?;
                    dao.replace_tags(id, &[RepoTag { name: "t".into(), category: "task".into() }])
                })
                .await
                .unwrap();
            self.ledger.record_change(path, repo_type, readme).await.unwrap()
        }

        fn client(&self) -> Arc<dyn SyncClient> {
            Arc::new(LedgerSyncClient::new(self.ledger.clone(), self.db.clone()))
        }
    }

    fn enabled() -> SyncConfig {
        SyncConfig { multi_sync_enabled: true, ..Default::default() }
    }

    fn engine(local: &Database, client: Arc<dyn SyncClient>) -> SyncEngine {
        SyncEngine::new(local.clone(), client, QuotaGate::disabled(), enabled(), "root")
    }

    async fn readme_of(db: &Database, path: &str) -> Option<String> {
        let path = path.to_string();
        db.with_conn(move |conn| Ok(RepositoryDao::new(conn).find_by_path("model", &path)?.map(|r| r.readme)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let origin = Origin::new(1);
        origin.write("ns/a", RepoType::Model, "x").await;
        let local = Database::open_in_memory().unwrap();
        let engine = SyncEngine::new(local, origin.client(), QuotaGate::disabled(), SyncConfig::default(), "root");
        assert_eq!(engine.sync_as_client().await.unwrap(), SyncReport::default());
    }

    /// [v1:A, v2:B, v3:A]：游标到 3，A 为 v3 内容，B 为 v2 内容
    #[tokio::test]
    async fn test_interleaved_versions_scenario() {
        let origin = Origin::new(1);
        origin.write("ns/A", RepoType::Model, "a-v1").await;
        origin.write("ns/B", RepoType::Model, "b-v2").await;
        origin.write("ns/A", RepoType::Model, "a-v3").await;

        let local = Database::open_in_memory().unwrap();
        let report = engine(&local, origin.client()).sync_as_client().await.unwrap();
        assert_eq!(report.cursor, 3);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.materialized, 2);
        assert_eq!(readme_of(&local, "ns/A").await.as_deref(), Some("a-v3"));
        assert_eq!(readme_of(&local, "ns/B").await.as_deref(), Some("b-v2"));

        let pending = local
            .with_conn(|conn| SyncVersionDao::new(conn).find_not_completed_distinct())
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    /// 重复同步不改变结果
    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let origin = Origin::new(1);
        origin.write("ns/A", RepoType::Model, "a").await;
        let local = Database::open_in_memory().unwrap();
        let e = engine(&local, origin.client());
        e.sync_as_client().await.unwrap();

        // 人为把版本重置为未完成，再物化一次
        local
            .with_conn(|conn| {
                conn.execute("UPDATE sync_versions SET completed = 0", [])?;
                Ok(())
            })
            .await
            .unwrap();
        let report = e.sync_as_client().await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.materialized, 1);

        let (repos, files) = local
            .with_conn(|conn| {
                let repos: i64 = conn.query_row("SELECT COUNT(*) FROM repositories", [], |r| r.get(0))?;
                let files: i64 = conn.query_row("SELECT COUNT(*) FROM repository_files", [], |r| r.get(0))?;
                Ok((repos, files))
            })
            .await
            .unwrap();
        assert_eq!((repos, files), (1, 1));
    }

    /// info 失败的条目保持未完成，游标照常前进，下一轮补上
    struct FlakyClient {
        inner: Arc<dyn SyncClient>,
        failing: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl SyncClient for FlakyClient {
        async fn latest(&self, cur: i64) -> Result<LatestResponse> {
            self.inner.latest(cur).await
        }
        async fn model_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
            if self.failing.lock().remove(&v.repo_path) {
                return Err(HubSyncError::Transport("connection reset".into()));
            }
            self.inner.model_info(v).await
        }
        async fn dataset_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
            self.inner.dataset_info(v).await
        }
        async fn repo_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
            self.inner.repo_info(v).await
        }
        async fn readme(&self, v: &SyncVersion) -> Result<String> {
            self.inner.readme(v).await
        }
        async fn file_list(&self, v: &SyncVersion) -> Result<Vec<RepoFile>> {
            self.inner.file_list(v).await
        }
    }

    #[tokio::test]
    async fn test_cursor_monotonic_and_failed_entry_retried() {
        let origin = Origin::new(1);
        origin.write("ns/A", RepoType::Model, "a").await;
        origin.write("ns/B", RepoType::Model, "b").await;
        let client = Arc::new(FlakyClient {
            inner: origin.client(),
            failing: Mutex::new(["ns/B".to_string()].into_iter().collect()),
        });
        let local = Database::open_in_memory().unwrap();
        let e = engine(&local, client);

        let first = e.sync_as_client().await.unwrap();
        assert_eq!(first.cursor, 2);
        assert_eq!(first.materialized, 1);
        assert_eq!(first.skipped, 1);
        assert!(readme_of(&local, "ns/B").await.is_none());

        origin.write("ns/C", RepoType::Model, "c").await;
        let second = e.sync_as_client().await.unwrap();
        assert!(second.cursor >= first.cursor);
        assert_eq!(second.cursor, 3);
        assert_eq!(second.materialized, 2);
        assert_eq!(readme_of(&local, "ns/B").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_non_default_source_gets_prefix_and_quota_rejects() {
        let origin = Origin::new(5);
        origin.write("ns/A", RepoType::Model, "a").await;
        origin.write("ns/B", RepoType::Model, "b").await;

        let quota_client = MemoryQuotaClient::new();
        quota_client.set_quota("root", QuotaInfo { repo_count_limit: 1, ..Default::default() });
        let local = Database::open_in_memory().unwrap();
        let e = SyncEngine::new(
            local.clone(),
            origin.client(),
            QuotaGate::new(Arc::new(quota_client)),
            enabled(),
            "root",
        );
        let report = e.sync_as_client().await.unwrap();
        assert_eq!(report.materialized, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(readme_of(&local, "s5_ns/A").await.as_deref(), Some("a"));
        assert!(readme_of(&local, "ns/A").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_repo_type_left_incomplete() {
        let origin = Origin::new(1);
        let local = Database::open_in_memory().unwrap();
        origin
            .db
            .with_conn(|conn| {
                SyncVersionDao::new(conn).create(&crate::storage::dao::sync_version::NewSyncVersion {
                    source_id: 1,
                    repo_path: "ns/p".into(),
                    repo_type: "prompt".into(),
                    ..Default::default()
                })
            })
            .await
            .unwrap();
        let report = engine(&local, origin.client()).sync_as_client().await.unwrap();
        assert_eq!(report.cursor, 1);
        assert_eq!(report.skipped, 1);
        let pending = local
            .with_conn(|conn| SyncVersionDao::new(conn).find_not_completed_distinct())
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }
}
