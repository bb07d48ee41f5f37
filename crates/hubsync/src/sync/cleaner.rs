//! clear-sync-version：压缩账本并删除已失效仓库的条目

use tracing::{info, warn};

use crate::error::Result;
use crate::storage::dao::repository::RepositoryDao;
use crate::storage::dao::sync_version::SyncVersionDao;
use crate::storage::Database;
use crate::sync::repo_filter::{LocalRepo, RepoFilter};
use crate::sync::types::local_repo_path;

/// 每页处理的版本条数
pub const CLEANUP_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// 被旧版本压缩删除的条数
    pub compacted: usize,
    /// 因仓库失效删除的条数
    pub removed: usize,
    pub kept: usize,
    pub failed_pages: usize,
    pub failed_types: usize,
}

pub struct SyncVersionCleaner {
    db: Database,
    filter: RepoFilter,
    page_size: usize,
}

impl SyncVersionCleaner {
    pub fn new(db: Database, filter: RepoFilter) -> Self {
        Self {
            db,
            filter,
            page_size: CLEANUP_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn run(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        report.compacted = self
            .db
            .with_conn(|conn| SyncVersionDao::new(conn).delete_old_versions())
            .await?;
        info!("已删除旧版本 {} 条", report.compacted);

        let types = self
            .db
            .with_conn(|conn| SyncVersionDao::new(conn).distinct_repo_types())
            .await?;
        for repo_type in types {
            match self.clean_type(&repo_type, &mut report).await {
                Ok((kept, removed)) => {
                    info!(repo_type = %repo_type, kept, removed, "清理完成");
                    report.kept += kept;
                    report.removed += removed;
                }
                Err(e) => {
                    warn!(repo_type = %repo_type, "清理该类型失败，继续下一个: {}", e);
                    report.failed_types += 1;
                }
            }
        }
        info!(
            "✅ 账本清理完成: compacted={} removed={} kept={}",
            report.compacted, report.removed, report.kept
        );
        Ok(report)
    }

    async fn clean_type(&self, repo_type: &str, report: &mut CleanupReport) -> Result<(usize, usize)> {
        let mut keep: Vec<String> = Vec::new();
        let mut after = 0i64;
        loop {
            let (rt, limit) = (repo_type.to_string(), self.page_size);
            let page = self
                .db
                .with_conn(move |conn| SyncVersionDao::new(conn).page_by_type(&rt, after, limit))
                .await?;
            let Some(last) = page.last() else { break };
            after = last.version;
            let full = page.len() == self.page_size;

            let rt = repo_type.to_string();
            let resolved = self
                .db
                .with_conn(move |conn| {
                    let dao = RepositoryDao::new(conn);
                    page.into_iter()
                        .map(|v| {
                            let local = dao.find_by_path(&rt, &local_repo_path(v.source_id, &v.repo_path))?;
                            Ok(LocalRepo { path: v.repo_path, local })
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .await;
            match resolved {
                Ok(repos) => keep.extend(self.filter.batch_match(&repos)),
                Err(e) => {
                    // 该页路径不进白名单，随后会被删除
                    warn!(repo_type, after, "解析本地仓库失败，跳过该页: {}", e);
                    report.failed_pages += 1;
                }
            }
            if !full {
                break;
            }
        }

        let kept = keep.len();
        let rt = repo_type.to_string();
        let removed = self
            .db
            .with_conn(move |conn| SyncVersionDao::new(conn).batch_delete_others(&rt, &keep))
            .await?;
        Ok((kept, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::sync_version::NewSyncVersion;
    use crate::storage::entities::RepositoryUpsert;

    async fn seed(db: &Database, versions: &[(&str, &str)], local: &[(&str, &str, bool)]) {
        let versions: Vec<(String, String)> = versions.iter().map(|(p, t)| (p.to_string(), t.to_string())).collect();
        let local: Vec<(String, String, bool)> =
            local.iter().map(|(p, t, d)| (p.to_string(), t.to_string(), *d)).collect();
        db.with_conn(move |conn| {
            let sv = SyncVersionDao::new(conn);
            for (path, t) in &versions {
                sv.create(&NewSyncVersion {
                    source_id: 1,
                    repo_path: path.clone(),
                    repo_type: t.clone(),
                    ..Default::default()
                })?;
            }
            let repos = RepositoryDao::new(conn);
            for (path, t, deleted) in &local {
                repos.upsert(&RepositoryUpsert {
                    repository_type: t.clone(),
                    path: path.clone(),
                    name: path.clone(),
                    ..Default::default()
                })?;
                if *deleted {
                    repos.soft_delete(t, path)?;
                }
            }
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn remaining(db: &Database) -> Vec<(String, String)> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT repo_path, repo_type FROM sync_versions ORDER BY version")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .unwrap()
    }

    /// 清理后只剩有效仓库的最新版本
    #[tokio::test]
    async fn test_cleanup_preserves_only_valid_latest() {
        let db = Database::open_in_memory().unwrap();
        seed(
            &db,
            &[
                ("ns/a", "model"),
                ("ns/b", "model"),
                ("ns/a", "model"),
                ("ns/gone", "model"),
                ("ns/bad.git", "model"),
                ("ns/d", "dataset"),
                ("ns/missing", "dataset"),
            ],
            &[
                ("ns/a", "model", false),
                ("ns/b", "model", false),
                ("ns/gone", "model", true),
                ("ns/bad.git", "model", false),
                ("ns/d", "dataset", false),
            ],
        )
        .await;

        let cleaner = SyncVersionCleaner::new(db.clone(), RepoFilter::new(&[]).unwrap()).with_page_size(2);
        let report = cleaner.run().await.unwrap();
        assert_eq!(report.compacted, 1);
        assert_eq!(report.kept, 3);
        assert_eq!(report.removed, 3);

        let left = remaining(&db).await;
        assert_eq!(
            left,
            vec![
                ("ns/b".to_string(), "model".to_string()),
                ("ns/a".to_string(), "model".to_string()),
                ("ns/d".to_string(), "dataset".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_type_without_valid_repos_is_emptied() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, &[("ns/x", "space"), ("ns/y", "space")], &[]).await;
        let report = SyncVersionCleaner::new(db.clone(), RepoFilter::new(&[]).unwrap())
            .run()
            .await
            .unwrap();
        assert_eq!(report.removed, 2);
        assert!(remaining(&db).await.is_empty());
    }
}
