//! 下游访问源站的客户端
//!
//! - `HttpSyncClient`：走源站 REST 接口，Bearer 鉴权，响应包在 `{data: ...}` 中
//! - `LedgerSyncClient`：直接读取同进程的源站账本与仓库表

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::{HubSyncError, Result};
use crate::http_client::{build_client, read_json};
use crate::storage::dao::repository::RepositoryDao;
use crate::storage::entities::{RepoFile, RepoType, SyncVersion};
use crate::storage::Database;
use crate::sync::ledger::{SyncVersionLedger, LATEST_BATCH_SIZE};
use crate::sync::types::{split_repo_path, Envelope, LatestResponse, RepoInfo};

#[async_trait]
pub trait SyncClient: Send + Sync {
    /// version > cur 的下一批
    async fn latest(&self, cur: i64) -> Result<LatestResponse>;

    async fn model_info(&self, v: &SyncVersion) -> Result<RepoInfo>;

    async fn dataset_info(&self, v: &SyncVersion) -> Result<RepoInfo>;

    /// code / space / mcp
    async fn repo_info(&self, v: &SyncVersion) -> Result<RepoInfo>;

    async fn readme(&self, v: &SyncVersion) -> Result<String>;

    async fn file_list(&self, v: &SyncVersion) -> Result<Vec<RepoFile>>;

    /// 按仓库类型选择 info 接口
    async fn info(&self, repo_type: RepoType, v: &SyncVersion) -> Result<RepoInfo> {
        match repo_type {
            RepoType::Model => self.model_info(v).await,
            RepoType::Dataset => self.dataset_info(v).await,
            RepoType::Code | RepoType::Space | RepoType::Mcp => self.repo_info(v).await,
        }
    }
}

pub struct HttpSyncClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl HttpSyncClient {
    pub fn new(endpoint: &str, token: &str, http: &HttpConfig) -> Result<Self> {
        url::Url::parse(endpoint)
            .map_err(|e| HubSyncError::Config(format!("源站地址无效 {}: {}", endpoint, e)))?;
        Ok(Self {
            http: build_client(http)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(%url, "请求源站");
        let response = self.http.get(&url).bearer_auth(&self.token).send().await?;
        let envelope: Envelope<T> = read_json(response).await?;
        Ok(envelope.data)
    }

    fn repo_url(v: &SyncVersion, suffix: &str) -> Result<String> {
        let repo_type: RepoType = v.repo_type.parse()?;
        let (ns, name) = split_repo_path(&v.repo_path)?;
        Ok(format!("/api/v1/{}/{}/{}{}", repo_type.plural(), ns, name, suffix))
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn latest(&self, cur: i64) -> Result<LatestResponse> {
        self.get_data(&format!("/api/v1/sync/version/latest?cur={}", cur)).await
    }

    async fn model_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
        let (ns, name) = split_repo_path(&v.repo_path)?;
        self.get_data(&format!("/api/v1/models/{}/{}", ns, name)).await
    }

    async fn dataset_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
        let (ns, name) = split_repo_path(&v.repo_path)?;
        self.get_data(&format!("/api/v1/datasets/{}/{}", ns, name)).await
    }

    async fn repo_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
        self.get_data(&Self::repo_url(v, "")?).await
    }

    async fn readme(&self, v: &SyncVersion) -> Result<String> {
        self.get_data(&Self::repo_url(v, "/raw/README.md")?).await
    }

    async fn file_list(&self, v: &SyncVersion) -> Result<Vec<RepoFile>> {
        self.get_data(&Self::repo_url(v, "/all_files")?).await
    }
}

/// 同进程的源站：账本 + 仓库表
#[derive(Debug, Clone)]
pub struct LedgerSyncClient {
    ledger: SyncVersionLedger,
    db: Database,
}

impl LedgerSyncClient {
    pub fn new(ledger: SyncVersionLedger, db: Database) -> Self {
        Self { ledger, db }
    }

    async fn load_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
        split_repo_path(&v.repo_path)?;
        let repo_type = v.repo_type.clone();
        let path = v.repo_path.clone();
        self.db
            .with_conn(move |conn| {
                let dao = RepositoryDao::new(conn);
                let repo = dao
                    .find_by_path(&repo_type, &path)?
                    .filter(|r| !r.is_deleted())
                    .ok_or_else(|| HubSyncError::NotFound(format!("源站仓库不存在: {}/{}", repo_type, path)))?;
                let tags = dao.list_tags(repo.id)?;
                Ok(RepoInfo {
                    path: repo.path,
                    name: repo.name,
                    nickname: repo.nickname,
                    description: repo.description,
                    license: repo.license,
                    private: repo.private,
                    default_branch: repo.default_branch,
                    downloads: repo.downloads,
                    likes: repo.likes,
                    tags,
                })
            })
            .await
    }
}

#[async_trait]
impl SyncClient for LedgerSyncClient {
    async fn latest(&self, cur: i64) -> Result<LatestResponse> {
        self.ledger.latest_after(cur, LATEST_BATCH_SIZE).await
    }

    async fn model_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
        self.load_info(v).await
    }

    async fn dataset_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
        self.load_info(v).await
    }

    async fn repo_info(&self, v: &SyncVersion) -> Result<RepoInfo> {
        self.load_info(v).await
    }

    async fn readme(&self, v: &SyncVersion) -> Result<String> {
        let (repo_type, path) = (v.repo_type.clone(), v.repo_path.clone());
        self.db
            .with_conn(move |conn| {
                RepositoryDao::new(conn)
                    .find_by_path(&repo_type, &path)?
                    .map(|r| r.readme)
                    .ok_or_else(|| HubSyncError::NotFound(format!("README 不存在: {}", path)))
            })
            .await
    }

    async fn file_list(&self, v: &SyncVersion) -> Result<Vec<RepoFile>> {
        let (repo_type, path) = (v.repo_type.clone(), v.repo_path.clone());
        self.db
            .with_conn(move |conn| {
                let dao = RepositoryDao::new(conn);
                let repo = dao
                    .find_by_path(&repo_type, &path)?
                    .ok_or_else(|| HubSyncError::NotFound(format!("源站仓库不存在: {}", path)))?;
                dao.list_files(repo.id)
            })
            .await
    }
}
