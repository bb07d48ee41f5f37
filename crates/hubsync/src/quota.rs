//! 多实例同步配额
//!
//! 物化一个仓库前先问计费服务：已经下载过的仓库免费重下；
//! 否则检查仓库数量与流量额度。拒绝结果直接返回给调用方，不在周期内重试。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AccountingConfig, HttpConfig};
use crate::error::{HubSyncError, Result};
use crate::http_client::{build_client, check_status, read_json};
use crate::storage::entities::RepoType;
use crate::sync::types::Envelope;

/// 用户的同步额度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaInfo {
    pub repo_count_limit: i64,
    pub repo_count_used: i64,
    /// 下载限速（字节/秒），0 表示不限
    pub speed_limit: i64,
    pub traffic_limit: i64,
    pub traffic_used: i64,
}

/// 下载记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatement {
    pub repo_path: String,
    pub repo_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Admit { speed_limit: i64 },
    Reject(String),
}

impl QuotaDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, QuotaDecision::Admit { .. })
    }
}

#[async_trait]
pub trait QuotaClient: Send + Sync {
    async fn quota(&self, user: &str) -> Result<QuotaInfo>;

    async fn find_download(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<Option<DownloadStatement>>;

    async fn create_download(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<()>;
}

/// 计费服务的 HTTP 客户端
pub struct HttpQuotaClient {
    http: Client,
    endpoint: String,
    api_token: String,
}

impl HttpQuotaClient {
    pub fn new(config: &AccountingConfig, http: &HttpConfig) -> Result<Self> {
        url::Url::parse(&config.endpoint)
            .map_err(|e| HubSyncError::Config(format!("计费服务地址无效 {}: {}", config.endpoint, e)))?;
        Ok(Self {
            http: build_client(http)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/accounting/multisync/{}", self.endpoint, path)
    }
}

#[async_trait]
impl QuotaClient for HttpQuotaClient {
    async fn quota(&self, user: &str) -> Result<QuotaInfo> {
        let response = self
            .http
            .get(self.url("quota"))
            .query(&[("current_user", user)])
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(QuotaInfo::default());
        }
        let envelope: Envelope<Option<QuotaInfo>> = read_json(response).await?;
        Ok(envelope.data.unwrap_or_default())
    }

    async fn find_download(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<Option<DownloadStatement>> {
        let response = self
            .http
            .get(self.url("download"))
            .query(&[("current_user", user), ("repo_path", repo_path), ("repo_type", repo_type.as_str())])
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: Envelope<Option<DownloadStatement>> = read_json(response).await?;
        Ok(envelope.data)
    }

    async fn create_download(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("download"))
            .query(&[("current_user", user)])
            .bearer_auth(&self.api_token)
            .json(&DownloadStatement {
                repo_path: repo_path.to_string(),
                repo_type: repo_type.as_str().to_string(),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// 内存实现，测试用
#[derive(Debug, Clone, Default)]
pub struct MemoryQuotaClient {
    quotas: Arc<Mutex<HashMap<String, QuotaInfo>>>,
    downloads: Arc<Mutex<HashSet<(String, String, String)>>>,
}

impl MemoryQuotaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quota(&self, user: &str, quota: QuotaInfo) {
        self.quotas.lock().insert(user.to_string(), quota);
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().len()
    }
}

#[async_trait]
impl QuotaClient for MemoryQuotaClient {
    async fn quota(&self, user: &str) -> Result<QuotaInfo> {
        Ok(self.quotas.lock().get(user).cloned().unwrap_or_default())
    }

    async fn find_download(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<Option<DownloadStatement>> {
        let key = (user.to_string(), repo_type.as_str().to_string(), repo_path.to_string());
        Ok(self.downloads.lock().contains(&key).then(|| DownloadStatement {
            repo_path: repo_path.to_string(),
            repo_type: repo_type.as_str().to_string(),
        }))
    }

    async fn create_download(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<()> {
        let key = (user.to_string(), repo_type.as_str().to_string(), repo_path.to_string());
        let newly = self.downloads.lock().insert(key);
        if newly {
            let mut quotas = self.quotas.lock();
            let q = quotas.entry(user.to_string()).or_default();
            q.repo_count_used += 1;
        }
        Ok(())
    }
}

/// 配额准入
#[derive(Clone)]
pub struct QuotaGate {
    client: Option<Arc<dyn QuotaClient>>,
}

impl std::fmt::Debug for QuotaGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGate").field("enabled", &self.is_enabled()).finish()
    }
}

impl QuotaGate {
    pub fn new(client: Arc<dyn QuotaClient>) -> Self {
        Self { client: Some(client) }
    }

    /// 关闭配额时全部放行
    pub fn disabled() -> Self {
        Self { client: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub async fn admit(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<QuotaDecision> {
        let Some(client) = &self.client else {
            return Ok(QuotaDecision::Admit { speed_limit: 0 });
        };

        if client.find_download(user, repo_type, repo_path).await?.is_some() {
            debug!(repo = %repo_path, "已有下载记录，重新下载不计额度");
            return Ok(QuotaDecision::Admit { speed_limit: 0 });
        }

        let q = client.quota(user).await?;
        if q.repo_count_limit > 0 && q.repo_count_used >= q.repo_count_limit {
            return Ok(QuotaDecision::Reject(format!(
                "仓库数量已达上限 {}/{}",
                q.repo_count_used, q.repo_count_limit
            )));
        }
        if q.traffic_limit > 0 && q.traffic_used >= q.traffic_limit {
            return Ok(QuotaDecision::Reject(format!(
                "流量已达上限 {}/{}",
                q.traffic_used, q.traffic_limit
            )));
        }
        Ok(QuotaDecision::Admit { speed_limit: q.speed_limit })
    }

    /// 仓库物化成功后记一条下载
    pub async fn record(&self, user: &str, repo_type: RepoType, repo_path: &str) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        client.create_download(user, repo_type, repo_path).await?;
        info!(user, repo = %repo_path, "已记录同步下载");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_gate_admits() {
        let gate = QuotaGate::disabled();
        assert!(gate.admit("root", RepoType::Model, "a/b").await.unwrap().is_admit());
        gate.record("root", RepoType::Model, "a/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_repo_count_limit() {
        let client = MemoryQuotaClient::new();
        client.set_quota(
            "root",
            QuotaInfo { repo_count_limit: 1, speed_limit: 1024, ..Default::default() },
        );
        let gate = QuotaGate::new(Arc::new(client.clone()));

        let d = gate.admit("root", RepoType::Model, "a/one").await.unwrap();
        assert_eq!(d, QuotaDecision::Admit { speed_limit: 1024 });
        gate.record("root", RepoType::Model, "a/one").await.unwrap();

        let d = gate.admit("root", RepoType::Model, "a/two").await.unwrap();
        assert!(matches!(d, QuotaDecision::Reject(_)));
        // 重新下载已有仓库不受限
        assert!(gate.admit("root", RepoType::Model, "a/one").await.unwrap().is_admit());
        assert_eq!(client.download_count(), 1);
    }

    #[tokio::test]
    async fn test_traffic_limit() {
        let client = MemoryQuotaClient::new();
        client.set_quota(
            "u",
            QuotaInfo { traffic_limit: 100, traffic_used: 100, ..Default::default() },
        );
        let gate = QuotaGate::new(Arc::new(client));
        assert!(!gate.admit("u", RepoType::Dataset, "a/b").await.unwrap().is_admit());
        // 其他用户没有额度记录，放行
        assert!(gate.admit("v", RepoType::Dataset, "a/b").await.unwrap().is_admit());
    }
}
