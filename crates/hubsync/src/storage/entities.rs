//! 数据库实体定义

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HubSyncError;
use crate::mirror::task::TaskStatus;

/// 仓库类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Model,
    Dataset,
    Code,
    Space,
    Mcp,
}

impl RepoType {
    pub const ALL: [RepoType; 5] = [
        RepoType::Model,
        RepoType::Dataset,
        RepoType::Code,
        RepoType::Space,
        RepoType::Mcp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Model => "model",
            RepoType::Dataset => "dataset",
            RepoType::Code => "code",
            RepoType::Space => "space",
            RepoType::Mcp => "mcp",
        }
    }

    /// REST 路径与裸仓库目录使用的复数形式
    pub fn plural(&self) -> &'static str {
        match self {
            RepoType::Model => "models",
            RepoType::Dataset => "datasets",
            RepoType::Code => "codes",
            RepoType::Space => "spaces",
            RepoType::Mcp => "mcps",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoType {
    type Err = HubSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(RepoType::Model),
            "dataset" => Ok(RepoType::Dataset),
            "code" => Ok(RepoType::Code),
            "space" => Ok(RepoType::Space),
            "mcp" => Ok(RepoType::Mcp),
            other => Err(HubSyncError::UnknownRepoType(other.to_string())),
        }
    }
}

/// 版本账本条目，version 即游标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncVersion {
    pub version: i64,
    pub source_id: i64,
    pub repo_path: String,
    /// 保留原始字符串，未知类型在物化阶段才报错
    pub repo_type: String,
    #[serde(default)]
    pub last_modified_at: String,
    #[serde(default)]
    pub change_log: String,
    #[serde(default)]
    pub completed: bool,
}

/// 本地仓库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub repository_type: String,
    pub path: String,
    pub name: String,
    pub nickname: String,
    pub description: String,
    pub license: String,
    pub private: bool,
    pub default_branch: String,
    pub source: String,
    pub sync_status: String,
    pub readme: String,
    pub downloads: i64,
    pub likes: i64,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Repository {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// 写入本地仓库所需的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryUpsert {
    pub repository_type: String,
    pub path: String,
    pub name: String,
    pub nickname: String,
    pub description: String,
    pub license: String,
    pub private: bool,
    pub default_branch: String,
    pub source: String,
    pub sync_status: String,
    pub readme: String,
    pub downloads: i64,
    pub likes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoFile {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub lfs: bool,
    #[serde(default)]
    pub lfs_oid: String,
    #[serde(default)]
    pub last_commit_sha: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoTag {
    pub name: String,
    #[serde(default)]
    pub category: String,
}

/// 镜像源
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSource {
    pub id: i64,
    pub source_name: String,
    pub info_api_url: String,
}

/// 镜像：源地址到本地仓库的持久绑定
#[derive(Debug, Clone, PartialEq)]
pub struct Mirror {
    pub id: i64,
    pub interval: String,
    pub source_url: String,
    pub mirror_source_id: i64,
    pub username: String,
    pub access_token: String,
    pub push_url: String,
    pub push_username: String,
    pub push_access_token: String,
    pub repository_id: i64,
    pub last_updated_at: Option<String>,
    pub source_repo_path: String,
    pub local_repo_path: String,
    pub last_message: String,
    pub push_mirror_created: bool,
    pub status: String,
    pub progress: i64,
    pub next_execution_timestamp: Option<String>,
    pub priority: i64,
    pub retry_count: i64,
    pub remote_updated_at: Option<String>,
    pub current_task_id: i64,
    pub sync_lfs: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// 创建或更新镜像所需的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewMirror {
    pub source_url: String,
    pub mirror_source_id: i64,
    pub username: String,
    pub access_token: String,
    pub push_url: String,
    pub repository_id: i64,
    pub source_repo_path: String,
    pub local_repo_path: String,
    pub priority: i64,
    pub sync_lfs: bool,
}

/// 镜像任务
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorTask {
    pub id: i64,
    pub mirror_id: i64,
    pub error_message: String,
    pub status: TaskStatus,
    pub retry_count: i64,
    pub payload: String,
    pub priority: i64,
    pub before_last_commit_id: String,
    pub after_last_commit_id: String,
    pub progress: i64,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub next_retry_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// 镜像源下发的凭证
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorToken {
    pub id: i64,
    pub source_name: String,
    pub token: String,
    pub concurrent_count: i64,
    pub max_bandwidth: i64,
}

/// 同步客户端设置，全局只有一条生效
#[derive(Debug, Clone, PartialEq)]
pub struct SyncClientSetting {
    pub id: i64,
    pub token: String,
    pub concurrent_count: i64,
    pub max_bandwidth: i64,
}
