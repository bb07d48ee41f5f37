//! 从 CSV 批量创建镜像
//!
//! 表头必须包含 `repo_type,repo_path`，可选 `source_url,default_branch,priority`。
//! 每行独立处理，无效或失败的行只记日志并计数。

use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{info, warn};

use crate::error::{HubSyncError, Result};
use crate::mirror::priority::MirrorPriority;
use crate::storage::dao::{MirrorDao, MirrorSourceDao, MirrorTaskDao, RepositoryDao};
use crate::storage::entities::{NewMirror, RepoType};
use crate::storage::Database;

const DEFAULT_SOURCE_HOST: &str = "https://huggingface.co";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub total: usize,
    pub created: usize,
    pub failed: usize,
}

/// 一行校验通过的导入记录
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub repo_type: RepoType,
    pub repo_path: String,
    pub source_url: String,
    pub default_branch: String,
    pub priority: MirrorPriority,
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    repo_type: usize,
    repo_path: usize,
    source_url: Option<usize>,
    default_branch: Option<usize>,
    priority: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let required = |name: &str| {
            find(name).ok_or_else(|| HubSyncError::InvalidArgument(format!("CSV 缺少必需列 {}", name)))
        };
        Ok(Self {
            repo_type: required("repo_type")?,
            repo_path: required("repo_path")?,
            source_url: find("source_url"),
            default_branch: find("default_branch"),
            priority: find("priority"),
        })
    }
}

/// HuggingFace 上的默认源地址，dataset 与 space 带类型前缀
pub fn default_source_url(repo_type: RepoType, path: &str) -> String {
    match repo_type {
        RepoType::Dataset => format!("{}/datasets/{}", DEFAULT_SOURCE_HOST, path),
        RepoType::Space => format!("{}/spaces/{}", DEFAULT_SOURCE_HOST, path),
        _ => format!("{}/{}", DEFAULT_SOURCE_HOST, path),
    }
}

/// 由源地址主机名得到镜像源名，例如 huggingface.co -> huggingface
pub fn source_name_for(source_url: &str) -> Result<String> {
    let url = url::Url::parse(source_url)
        .map_err(|e| HubSyncError::InvalidArgument(format!("无效的源地址 {}: {}", source_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| HubSyncError::InvalidArgument(format!("源地址缺少主机名: {}", source_url)))?;
    let host = host.trim_start_matches("www.").trim_start_matches("hub.");
    Ok(host.split('.').next().unwrap_or(host).to_string())
}

fn parse_row(record: &StringRecord, cols: Columns) -> Result<ImportRow> {
    let get = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("").trim();

    let repo_type: RepoType = get(Some(cols.repo_type)).to_ascii_lowercase().parse()?;
    let repo_path = get(Some(cols.repo_path)).trim_matches('/').to_string();
    let mut parts = repo_path.split('/');
    let valid_path = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty()
    );
    if !valid_path {
        return Err(HubSyncError::InvalidData(format!("仓库路径必须是 namespace/name: {:?}", repo_path)));
    }

    let source_url = match get(cols.source_url) {
        "" => default_source_url(repo_type, &repo_path),
        url => url.to_string(),
    };
    let default_branch = match get(cols.default_branch) {
        "" => "main".to_string(),
        b => b.to_string(),
    };
    let priority = get(cols.priority).parse::<MirrorPriority>()?;

    Ok(ImportRow {
        repo_type,
        repo_path,
        source_url,
        default_branch,
        priority,
    })
}

pub struct MirrorImporter {
    db: Database,
}

impl MirrorImporter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 读取 CSV 并为每个有效行建仓库、镜像与 queued 任务
    ///
    /// 文件打不开或缺少必需列时返回错误，单行错误只计入 `failed`。
    pub async fn import_csv(&self, path: impl AsRef<Path>, sync_lfs: bool) -> Result<ImportReport> {
        let path = path.as_ref();
        let mut reader = ReaderBuilder::new().trim(Trim::All).flexible(true).from_path(path)?;
        let cols = Columns::from_headers(reader.headers()?)?;

        let mut report = ImportReport::default();
        for (idx, record) in reader.records().enumerate() {
            report.total += 1;
            // 表头占第 1 行
            let line = idx + 2;
            let row = match record.map_err(HubSyncError::from).and_then(|r| parse_row(&r, cols)) {
                Ok(row) => row,
                Err(e) => {
                    warn!(line, "跳过无效行: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            match self.import_row(&row, sync_lfs).await {
                Ok(task_id) => {
                    info!(line, repo = %row.repo_path, task_id, "镜像已创建");
                    report.created += 1;
                }
                Err(e) => {
                    warn!(line, repo = %row.repo_path, "创建镜像失败: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            file = %path.display(),
            total = report.total,
            created = report.created,
            failed = report.failed,
            "CSV 导入完成"
        );
        Ok(report)
    }

    /// 返回新建任务的 id
    pub async fn import_row(&self, row: &ImportRow, sync_lfs: bool) -> Result<i64> {
        let source_name = source_name_for(&row.source_url)?;
        self.db
            .with_conn(|conn| {
                let sources = MirrorSourceDao::new(conn);
                let source = match sources.find_by_name(&source_name)? {
                    Some(s) => s,
                    None => sources.upsert(&source_name, "")?,
                };
                let repository =
                    RepositoryDao::new(conn).ensure(row.repo_type.as_str(), &row.repo_path, &row.default_branch, &source_name)?;
                let mirror = MirrorDao::new(conn).upsert_by_source_url(&NewMirror {
                    source_url: row.source_url.clone(),
                    mirror_source_id: source.id,
                    repository_id: repository.id,
                    source_repo_path: row.repo_path.clone(),
                    local_repo_path: row.repo_path.clone(),
                    priority: row.priority.value(),
                    sync_lfs,
                    ..Default::default()
                })?;
                let task = MirrorTaskDao::new(conn).create_task_cancelling_others(mirror.id, row.priority.value(), "")?;
                Ok(task.id)
            })
            .await
    }
}
