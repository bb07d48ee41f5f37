//! LFS 对象存储、远端批量下载与传输断点

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::{HubSyncError, Result};
use crate::http_client::{build_client, check_status, read_json};
use crate::mirror::git::{LfsPointer, MirrorSyncRequest};
use crate::storage::kv::{trees, KvStore};
use crate::throttle::RateLimiter;
use crate::utils::time::now_string;

const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";

/// 本地 LFS 对象目录，布局 `{root}/{oid[0..2]}/{oid[2..4]}/{oid}`
#[derive(Debug, Clone)]
pub struct LfsStore {
    root: PathBuf,
}

impl LfsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, oid: &str) -> Result<PathBuf> {
        if oid.len() < 5 || !oid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HubSyncError::InvalidData(format!("无效的 LFS oid: {}", oid)));
        }
        Ok(self.root.join(&oid[0..2]).join(&oid[2..4]).join(oid))
    }

    pub async fn contains(&self, oid: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(oid)?).await?)
    }

    /// 下载用的临时文件路径
    pub fn temp_path(&self, oid: &str) -> PathBuf {
        self.root.join("tmp").join(format!("{}.{}", oid, uuid::Uuid::new_v4().simple()))
    }

    /// 校验临时文件的 sha256 后移入正式位置；校验失败删除临时文件
    pub async fn commit(&self, oid: &str, tmp: &Path) -> Result<()> {
        let actual = sha256_file(tmp).await?;
        if !actual.eq_ignore_ascii_case(oid) {
            let _ = tokio::fs::remove_file(tmp).await;
            return Err(HubSyncError::InvalidData(format!(
                "LFS 对象校验失败: 期望 {} 实际 {}",
                oid, actual
            )));
        }
        let dest = self.object_path(oid)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(tmp, &dest).await?;
        Ok(())
    }
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 批量接口返回的单个对象下载动作
#[derive(Debug, Clone, PartialEq)]
pub struct LfsDownload {
    pub oid: String,
    pub size: u64,
    pub href: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    operation: &'a str,
    transfers: [&'a str; 1],
    objects: Vec<BatchObjectRef<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchObjectRef<'a> {
    oid: &'a str,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    objects: Vec<BatchObject>,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    oid: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    actions: Option<BatchActions>,
    #[serde(default)]
    error: Option<BatchError>,
}

#[derive(Debug, Deserialize)]
struct BatchActions {
    download: Option<BatchAction>,
}

#[derive(Debug, Deserialize)]
struct BatchAction {
    href: String,
    #[serde(default)]
    header: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct BatchError {
    code: u16,
    message: String,
}

/// 上游 LFS 服务
#[async_trait]
pub trait LfsRemote: Send + Sync {
    /// 为一组对象申请下载地址
    async fn batch(&self, req: &MirrorSyncRequest, objects: &[LfsPointer]) -> Result<Vec<LfsDownload>>;

    /// 下载到 dest，按 limiter 限速
    async fn download(&self, action: &LfsDownload, dest: &Path, limiter: &RateLimiter) -> Result<u64>;
}

/// `{repo}.git/info/lfs/objects/batch`
pub fn batch_url(source_url: &str) -> String {
    let base = source_url.trim_end_matches('/');
    if base.ends_with(".git") {
        format!("{}/info/lfs/objects/batch", base)
    } else {
        format!("{}.git/info/lfs/objects/batch", base)
    }
}

pub struct HttpLfsRemote {
    client: Client,
}

impl HttpLfsRemote {
    pub fn new(http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(http)?,
        })
    }
}

#[async_trait]
impl LfsRemote for HttpLfsRemote {
    async fn batch(&self, req: &MirrorSyncRequest, objects: &[LfsPointer]) -> Result<Vec<LfsDownload>> {
        let body = BatchRequest {
            operation: "download",
            transfers: ["basic"],
            objects: objects
                .iter()
                .map(|p| BatchObjectRef { oid: &p.oid, size: p.size })
                .collect(),
        };
        let mut builder = self
            .client
            .post(batch_url(&req.source_url))
            .header(reqwest::header::ACCEPT, LFS_MEDIA_TYPE)
            .header(reqwest::header::CONTENT_TYPE, LFS_MEDIA_TYPE)
            .json(&body);
        if !req.access_token.is_empty() {
            let user = if req.username.is_empty() { "oauth2" } else { req.username.as_str() };
            builder = builder.basic_auth(user, Some(&req.access_token));
        }
        let response = check_status(builder.send().await?).await?;
        let parsed: BatchResponse = read_json(response).await?;

        let mut actions = Vec::with_capacity(parsed.objects.len());
        for obj in parsed.objects {
            if let Some(err) = obj.error {
                return Err(HubSyncError::Http {
                    status: err.code,
                    message: format!("LFS 对象 {} 不可下载: {}", obj.oid, err.message),
                });
            }
            let Some(download) = obj.actions.and_then(|a| a.download) else {
                continue;
            };
            actions.push(LfsDownload {
                oid: obj.oid,
                size: obj.size,
                href: download.href,
                headers: download.header,
            });
        }
        Ok(actions)
    }

    async fn download(&self, action: &LfsDownload, dest: &Path, limiter: &RateLimiter) -> Result<u64> {
        let mut builder = self.client.get(&action.href);
        for (k, v) in &action.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let response = check_status(builder.send().await?).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            limiter.acquire(chunk.len() as f64).await;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(oid = %action.oid, bytes = written, "LFS 对象下载完成");
        Ok(written)
    }
}

/// 测试用 LFS 远端：oid -> 内容
#[derive(Debug, Clone, Default)]
pub struct MemoryLfsRemote {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    downloads: Arc<Mutex<Vec<String>>>,
    /// oid -> 剩余失败次数
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl MemoryLfsRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一个对象，返回对应的指针
    pub fn put(&self, path: &str, content: &[u8]) -> LfsPointer {
        let oid = hex::encode(Sha256::digest(content));
        self.objects.lock().insert(oid.clone(), content.to_vec());
        LfsPointer {
            oid,
            size: content.len() as u64,
            path: path.to_string(),
        }
    }

    pub fn fail_times(&self, oid: &str, times: u32) {
        self.failures.lock().insert(oid.to_string(), times);
    }

    /// 每次下载调用的 oid，按顺序
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }
}

#[async_trait]
impl LfsRemote for MemoryLfsRemote {
    async fn batch(&self, _req: &MirrorSyncRequest, objects: &[LfsPointer]) -> Result<Vec<LfsDownload>> {
        let known = self.objects.lock();
        objects
            .iter()
            .map(|p| {
                if !known.contains_key(&p.oid) {
                    return Err(HubSyncError::Http {
                        status: 404,
                        message: format!("LFS 对象不存在: {}", p.oid),
                    });
                }
                Ok(LfsDownload {
                    oid: p.oid.clone(),
                    size: p.size,
                    href: format!("memory://{}", p.oid),
                    headers: HashMap::new(),
                })
            })
            .collect()
    }

    async fn download(&self, action: &LfsDownload, dest: &Path, limiter: &RateLimiter) -> Result<u64> {
        self.downloads.lock().push(action.oid.clone());
        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&action.oid) {
                if *left > 0 {
                    *left -= 1;
                    return Err(HubSyncError::Transport(format!("下载 {} 中断", action.oid)));
                }
            }
        }
        let content = self
            .objects
            .lock()
            .get(&action.oid)
            .cloned()
            .ok_or_else(|| HubSyncError::NotFound(format!("LFS 对象不存在: {}", action.oid)))?;
        limiter.acquire(content.len() as f64).await;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &content).await?;
        Ok(content.len() as u64)
    }
}

/// 已完成对象的断点记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LfsCheckpoint {
    pub oid: String,
    pub size: u64,
    pub done_at: String,
}

/// sled 中的 LFS 断点，key = `{mirror_id}/{oid}`
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    kv: KvStore,
}

impl CheckpointStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    fn key(mirror_id: i64, oid: &str) -> String {
        format!("{}/{}", mirror_id, oid)
    }

    pub fn is_done(&self, mirror_id: i64, oid: &str) -> Result<bool> {
        self.kv.exists(trees::LFS_CHECKPOINTS, Self::key(mirror_id, oid))
    }

    pub fn mark_done(&self, mirror_id: i64, pointer: &LfsPointer) -> Result<()> {
        let cp = LfsCheckpoint {
            oid: pointer.oid.clone(),
            size: pointer.size,
            done_at: now_string(),
        };
        self.kv
            .set(trees::LFS_CHECKPOINTS, Self::key(mirror_id, &pointer.oid), &cp)
    }

    pub fn list(&self, mirror_id: i64) -> Result<Vec<LfsCheckpoint>> {
        let prefix = format!("{}/", mirror_id);
        Ok(self
            .kv
            .scan_prefix::<LfsCheckpoint>(trees::LFS_CHECKPOINTS, prefix.as_bytes())?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// 任务结束后清掉该镜像的断点
    pub fn clear(&self, mirror_id: i64) -> Result<usize> {
        let prefix = format!("{}/", mirror_id);
        self.kv.remove_prefix(trees::LFS_CHECKPOINTS, prefix.as_bytes())
    }
}
