//! 拉取同步协议的数据类型

use serde::{Deserialize, Serialize};

use crate::error::{HubSyncError, Result};
use crate::storage::entities::{RepoFile, RepoTag, SyncVersion};

/// 默认源站的 source_id，本地路径不加前缀
pub const DEFAULT_SOURCE_ID: i64 = 1;

/// `GET /api/v1/sync/version/latest` 的响应体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatestResponse {
    #[serde(default)]
    pub versions: Vec<SyncVersion>,
    #[serde(default)]
    pub has_more: bool,
}

impl LatestResponse {
    /// 本批最后一个版本；空批次时保持 cur
    pub fn next_cursor(&self, cur: i64) -> i64 {
        self.versions.last().map(|v| v.version).unwrap_or(cur)
    }
}

/// 源站返回的仓库元信息（模型、数据集与其他类型共用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoInfo {
    pub path: String,
    pub name: String,
    pub nickname: String,
    pub description: String,
    pub license: String,
    pub private: bool,
    pub default_branch: String,
    pub downloads: i64,
    pub likes: i64,
    pub tags: Vec<RepoTag>,
}

/// 源站完整内容：元信息 + README + 文件列表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoSnapshot {
    pub info: RepoInfo,
    pub readme: String,
    pub files: Vec<RepoFile>,
}

/// REST 响应统一包在 `{ "data": ... }` 中
#[derive(Debug, Deserialize, Serialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// `namespace/name` 按第一个 `/` 拆开
pub fn split_repo_path(path: &str) -> Result<(&str, &str)> {
    match path.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok((ns, name)),
        _ => Err(HubSyncError::InvalidData(format!("仓库路径格式错误: {}", path))),
    }
}

pub fn source_prefix(source_id: i64) -> String {
    if source_id == DEFAULT_SOURCE_ID {
        String::new()
    } else {
        format!("s{}_", source_id)
    }
}

/// 源站路径转本地路径：`{prefix}{namespace}/{name}`
pub fn local_repo_path(source_id: i64, repo_path: &str) -> String {
    format!("{}{}", source_prefix(source_id), repo_path)
}

/// local_repo_path 的逆操作，返回 (source_id, 源站路径)
pub fn strip_source_prefix(path: &str) -> (i64, &str) {
    let Some(rest) = path.strip_prefix('s') else {
        return (DEFAULT_SOURCE_ID, path);
    };
    let Some((digits, tail)) = rest.split_once('_') else {
        return (DEFAULT_SOURCE_ID, path);
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (DEFAULT_SOURCE_ID, path);
    }
    match digits.parse::<i64>() {
        Ok(id) if id != DEFAULT_SOURCE_ID => (id, tail),
        _ => (DEFAULT_SOURCE_ID, path),
    }
}
