//! 裸仓库操作
//!
//! `GitCliServer` 调用本机 `git`，所有命令带超时；`MemoryGitServer` 在内存里模拟
//! 上游与本地仓库，供测试使用。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{HttpConfig, MirrorConfig};
use crate::error::{HubSyncError, Result};
use crate::http_client::{build_client, check_status};
use crate::storage::entities::RepoType;

const LFS_POINTER_MAX_SIZE: u64 = 1024;
const LFS_SPEC_PREFIX: &str = "version https://git-lfs.github.com/spec/";
const PUSH_REMOTE: &str = "hubsync-push";

/// 本地裸仓库标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub repo_type: RepoType,
    pub path: String,
}

impl RepoRef {
    pub fn new(repo_type: RepoType, path: impl Into<String>) -> Self {
        Self {
            repo_type,
            path: path.into(),
        }
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repo_type.plural(), self.path)
    }
}

/// 一次镜像拉取的源与凭证
#[derive(Clone, Default, PartialEq)]
pub struct MirrorSyncRequest {
    pub source_url: String,
    pub username: String,
    pub access_token: String,
}

impl std::fmt::Debug for MirrorSyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSyncRequest")
            .field("source_url", &self.source_url)
            .field("username", &self.username)
            .field("access_token", &if self.access_token.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// LFS 指针文件
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LfsPointer {
    pub oid: String,
    pub size: u64,
    #[serde(default)]
    pub path: String,
}

impl LfsPointer {
    /// 解析指针文件内容，不是指针时返回 None
    pub fn parse(content: &str, path: &str) -> Option<Self> {
        if !content.starts_with(LFS_SPEC_PREFIX) {
            return None;
        }
        let mut oid = None;
        let mut size = None;
        for line in content.lines() {
            if let Some(v) = line.strip_prefix("oid sha256:") {
                oid = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("size ") {
                size = v.trim().parse().ok();
            }
        }
        Some(Self {
            oid: oid?,
            size: size?,
            path: path.to_string(),
        })
    }
}

#[async_trait]
pub trait GitServer: Send + Sync {
    /// 不存在时创建裸仓库
    async fn ensure_repo(&self, repo: &RepoRef) -> Result<()>;

    /// 检查上游是否可访问：404/410 为已删除，401/403 为凭证错误
    async fn check_source(&self, req: &MirrorSyncRequest) -> Result<()>;

    /// 从上游拉取所有分支与标签，并把 HEAD 指向上游默认分支
    async fn mirror_sync(&self, repo: &RepoRef, req: &MirrorSyncRequest) -> Result<()>;

    async fn default_branch(&self, repo: &RepoRef) -> Result<String>;

    /// 分支当前提交，分支不存在返回 None
    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<Option<String>>;

    async fn set_branch(&self, repo: &RepoRef, branch: &str, commit: &str) -> Result<()>;

    /// 列出某个提交下的所有 LFS 指针（按 oid 去重）
    async fn list_lfs_pointers(&self, repo: &RepoRef, rev: &str) -> Result<Vec<LfsPointer>>;

    async fn create_push_mirror(&self, repo: &RepoRef, push_url: &str, username: &str, token: &str) -> Result<()>;
}

/// 把凭证写进 URL
pub fn authed_url(raw: &str, username: &str, token: &str) -> Result<String> {
    if token.is_empty() {
        return Ok(raw.to_string());
    }
    let mut url = url::Url::parse(raw).map_err(|e| HubSyncError::InvalidArgument(format!("无效的仓库地址 {}: {}", raw, e)))?;
    let user = if username.is_empty() { "oauth2" } else { username };
    url.set_username(user)
        .map_err(|_| HubSyncError::InvalidArgument(format!("无法设置用户名: {}", raw)))?;
    url.set_password(Some(token))
        .map_err(|_| HubSyncError::InvalidArgument(format!("无法设置凭证: {}", raw)))?;
    Ok(url.to_string())
}

fn dedup_by_oid(pointers: Vec<LfsPointer>) -> Vec<LfsPointer> {
    let mut seen = std::collections::HashSet::new();
    pointers.into_iter().filter(|p| seen.insert(p.oid.clone())).collect()
}

pub struct GitCliServer {
    binary: String,
    repos_root: PathBuf,
    timeout: Duration,
    http: Client,
}

impl GitCliServer {
    pub fn new(config: &MirrorConfig, http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            binary: config.git_binary.clone(),
            repos_root: config.repos_root.clone(),
            timeout: Duration::from_secs(config.git_timeout_secs),
            http: build_client(http)?,
        })
    }

    pub fn repo_dir(&self, repo: &RepoRef) -> PathBuf {
        self.repos_root
            .join(repo.repo_type.plural())
            .join(format!("{}.git", repo.path))
    }

    /// 执行 git，失败时把 stderr 中的凭证替换掉后返回 `Git` 错误
    async fn git(&self, dir: Option<&Path>, args: &[&str], secret: &str, stdin: Option<&[u8]>) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| HubSyncError::Git(format!("启动 git 失败: {}", e)))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            drop(pipe);
        }
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HubSyncError::Timeout(format!("git {} 超时", args.first().copied().unwrap_or(""))))??;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !secret.is_empty() {
            stderr = stderr.replace(secret, "***");
        }
        Err(HubSyncError::Git(format!(
            "git {} 失败 ({}): {}",
            args.first().copied().unwrap_or(""),
            output.status,
            stderr
        )))
    }

    async fn remote_default_branch(&self, url: &str, secret: &str) -> Result<Option<String>> {
        let out = self.git(None, &["ls-remote", "--symref", url, "HEAD"], secret, None).await?;
        Ok(out.lines().find_map(|line| {
            line.strip_prefix("ref: refs/heads/")
                .and_then(|rest| rest.split('\t').next())
                .map(|b| b.to_string())
        }))
    }
}

#[async_trait]
impl GitServer for GitCliServer {
    async fn ensure_repo(&self, repo: &RepoRef) -> Result<()> {
        let dir = self.repo_dir(repo);
        if tokio::fs::try_exists(dir.join("HEAD")).await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dir_str = dir.to_string_lossy().into_owned();
        self.git(None, &["init", "--bare", &dir_str], "", None).await?;
        info!("创建裸仓库: {}", dir.display());
        Ok(())
    }

    async fn check_source(&self, req: &MirrorSyncRequest) -> Result<()> {
        let url = format!("{}/info/refs?service=git-upload-pack", req.source_url.trim_end_matches('/'));
        let mut builder = self.http.get(&url);
        if !req.access_token.is_empty() {
            let user = if req.username.is_empty() { "oauth2" } else { req.username.as_str() };
            builder = builder.basic_auth(user, Some(&req.access_token));
        }
        let response = builder.send().await?;
        match response.status().as_u16() {
            404 | 410 => Err(HubSyncError::UpstreamGone(req.source_url.clone())),
            401 | 403 => Err(HubSyncError::Auth(format!("无权访问上游仓库: {}", req.source_url))),
            _ => {
                check_status(response).await?;
                Ok(())
            }
        }
    }

    async fn mirror_sync(&self, repo: &RepoRef, req: &MirrorSyncRequest) -> Result<()> {
        let dir = self.repo_dir(repo);
        let url = authed_url(&req.source_url, &req.username, &req.access_token)?;
        let secret = req.access_token.as_str();
        self.git(
            Some(&dir),
            &["fetch", "--prune", "--force", &url, "+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"],
            secret,
            None,
        )
        .await?;
        if let Some(branch) = self.remote_default_branch(&url, secret).await? {
            let head = format!("refs/heads/{}", branch);
            self.git(Some(&dir), &["symbolic-ref", "HEAD", &head], "", None).await?;
        }
        debug!(repo = %repo, "git fetch 完成");
        Ok(())
    }

    async fn default_branch(&self, repo: &RepoRef) -> Result<String> {
        let out = self
            .git(Some(&self.repo_dir(repo)), &["symbolic-ref", "--short", "HEAD"], "", None)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<Option<String>> {
        let refname = format!("refs/heads/{}", branch);
        match self
            .git(Some(&self.repo_dir(repo)), &["rev-parse", "--verify", "--quiet", &refname], "", None)
            .await
        {
            Ok(out) => Ok(Some(out.trim().to_string()).filter(|s| !s.is_empty())),
            Err(HubSyncError::Git(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_branch(&self, repo: &RepoRef, branch: &str, commit: &str) -> Result<()> {
        let refname = format!("refs/heads/{}", branch);
        self.git(Some(&self.repo_dir(repo)), &["update-ref", &refname, commit], "", None)
            .await?;
        Ok(())
    }

    async fn list_lfs_pointers(&self, repo: &RepoRef, rev: &str) -> Result<Vec<LfsPointer>> {
        let dir = self.repo_dir(repo);
        let tree = self.git(Some(&dir), &["ls-tree", "-r", "-l", rev], "", None).await?;

        // <mode> blob <sha> <size>\t<path>
        let mut candidates: Vec<(String, String)> = Vec::new();
        for line in tree.lines() {
            let Some((meta, path)) = line.split_once('\t') else { continue };
            let parts: Vec<&str> = meta.split_whitespace().collect();
            if parts.len() != 4 || parts[1] != "blob" {
                continue;
            }
            match parts[3].parse::<u64>() {
                Ok(size) if size <= LFS_POINTER_MAX_SIZE => candidates.push((parts[2].to_string(), path.to_string())),
                _ => {}
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let input: String = candidates.iter().map(|(sha, _)| format!("{}\n", sha)).collect();
        let out = self
            .git(Some(&dir), &["cat-file", "--batch"], "", Some(input.as_bytes()))
            .await?;

        // 每个对象：`<sha> blob <size>\n<content>\n`
        let mut pointers = Vec::new();
        let mut rest = out.as_str();
        for (_, path) in &candidates {
            let Some((header, body)) = rest.split_once('\n') else { break };
            let size: usize = header.split_whitespace().nth(2).and_then(|s| s.parse().ok()).unwrap_or(0);
            let content = body.get(..size).unwrap_or(body);
            if let Some(p) = LfsPointer::parse(content, path) {
                pointers.push(p);
            }
            rest = body.get(size..).map(|s| s.strip_prefix('\n').unwrap_or(s)).unwrap_or("");
        }
        Ok(dedup_by_oid(pointers))
    }

    async fn create_push_mirror(&self, repo: &RepoRef, push_url: &str, username: &str, token: &str) -> Result<()> {
        let dir = self.repo_dir(repo);
        let url = authed_url(push_url, username, token)?;
        let key = format!("remote.{}.url", PUSH_REMOTE);
        self.git(Some(&dir), &["config", &key, &url], token, None).await?;
        let mirror_key = format!("remote.{}.mirror", PUSH_REMOTE);
        self.git(Some(&dir), &["config", &mirror_key, "true"], "", None).await?;
        self.git(Some(&dir), &["push", "--mirror", PUSH_REMOTE], token, None).await?;
        info!(repo = %repo, "已创建推送镜像");
        Ok(())
    }
}

/// 内存中的上游仓库
#[derive(Debug, Clone, Default)]
pub struct UpstreamRepo {
    pub default_branch: String,
    pub head: String,
    pub lfs: Vec<LfsPointer>,
}

#[derive(Debug, Default)]
struct LocalRepo {
    head_ref: String,
    branches: HashMap<String, String>,
    lfs_by_commit: HashMap<String, Vec<LfsPointer>>,
}

#[derive(Debug, Default)]
struct MemoryGitState {
    upstreams: HashMap<String, UpstreamRepo>,
    repos: HashMap<RepoRef, LocalRepo>,
    failures: HashMap<String, Vec<HubSyncError>>,
    push_mirrors: Vec<(RepoRef, String)>,
    sync_calls: usize,
}

/// 测试用 git 服务
#[derive(Debug, Clone, Default)]
pub struct MemoryGitServer {
    state: Arc<Mutex<MemoryGitState>>,
}

impl MemoryGitServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_upstream(&self, source_url: &str, upstream: UpstreamRepo) {
        self.state.lock().upstreams.insert(source_url.to_string(), upstream);
    }

    pub fn remove_upstream(&self, source_url: &str) {
        self.state.lock().upstreams.remove(source_url);
    }

    /// 下一次对该上游的 mirror_sync 返回 err
    pub fn fail_next_sync(&self, source_url: &str, err: HubSyncError) {
        self.state
            .lock()
            .failures
            .entry(source_url.to_string())
            .or_default()
            .push(err);
    }

    pub fn head(&self, repo: &RepoRef, branch: &str) -> Option<String> {
        self.state
            .lock()
            .repos
            .get(repo)
            .and_then(|r| r.branches.get(branch).cloned())
    }

    pub fn push_mirrors(&self) -> Vec<(RepoRef, String)> {
        self.state.lock().push_mirrors.clone()
    }

    pub fn sync_calls(&self) -> usize {
        self.state.lock().sync_calls
    }
}

#[async_trait]
impl GitServer for MemoryGitServer {
    async fn ensure_repo(&self, repo: &RepoRef) -> Result<()> {
        self.state.lock().repos.entry(repo.clone()).or_insert_with(|| LocalRepo {
            head_ref: "main".to_string(),
            ..Default::default()
        });
        Ok(())
    }

    async fn check_source(&self, req: &MirrorSyncRequest) -> Result<()> {
        if self.state.lock().upstreams.contains_key(&req.source_url) {
            Ok(())
        } else {
            Err(HubSyncError::UpstreamGone(req.source_url.clone()))
        }
    }

    async fn mirror_sync(&self, repo: &RepoRef, req: &MirrorSyncRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.sync_calls += 1;
        if let Some(errs) = state.failures.get_mut(&req.source_url) {
            if !errs.is_empty() {
                return Err(errs.remove(0));
            }
        }
        let upstream = state
            .upstreams
            .get(&req.source_url)
            .cloned()
            .ok_or_else(|| HubSyncError::UpstreamGone(req.source_url.clone()))?;
        let local = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| HubSyncError::NotFound(format!("裸仓库不存在: {}", repo)))?;
        local.head_ref = upstream.default_branch.clone();
        local.branches.insert(upstream.default_branch.clone(), upstream.head.clone());
        local.lfs_by_commit.insert(upstream.head.clone(), dedup_by_oid(upstream.lfs));
        Ok(())
    }

    async fn default_branch(&self, repo: &RepoRef) -> Result<String> {
        self.state
            .lock()
            .repos
            .get(repo)
            .map(|r| r.head_ref.clone())
            .ok_or_else(|| HubSyncError::NotFound(format!("裸仓库不存在: {}", repo)))
    }

    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<Option<String>> {
        Ok(self.head(repo, branch))
    }

    async fn set_branch(&self, repo: &RepoRef, branch: &str, commit: &str) -> Result<()> {
        let mut state = self.state.lock();
        let local = state
            .repos
            .get_mut(repo)
            .ok_or_else(|| HubSyncError::NotFound(format!("裸仓库不存在: {}", repo)))?;
        local.branches.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    async fn list_lfs_pointers(&self, repo: &RepoRef, rev: &str) -> Result<Vec<LfsPointer>> {
        let state = self.state.lock();
        let local = state
            .repos
            .get(repo)
            .ok_or_else(|| HubSyncError::NotFound(format!("裸仓库不存在: {}", repo)))?;
        let commit = local.branches.get(rev).map(String::as_str).unwrap_or(rev);
        Ok(local.lfs_by_commit.get(commit).cloned().unwrap_or_default())
    }

    async fn create_push_mirror(&self, repo: &RepoRef, push_url: &str, _username: &str, _token: &str) -> Result<()> {
        self.state.lock().push_mirrors.push((repo.clone(), push_url.to_string()));
        Ok(())
    }
}
