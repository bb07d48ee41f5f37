//! 本地仓库数据访问层（含文件列表与标签）

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{HubSyncError, Result};
use crate::storage::entities::{RepoFile, RepoTag, Repository, RepositoryUpsert};
use crate::utils::time::now_string;

const COLUMNS: &str = "id, repository_type, path, name, nickname, description, license, private,
    default_branch, source, sync_status, readme, downloads, likes, deleted_at, created_at, updated_at";

pub struct RepositoryDao<'a> {
    conn: &'a Connection,
}

impl<'a> RepositoryDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: i64) -> Result<Option<Repository>> {
        let sql = format!("SELECT {} FROM repositories WHERE id = ?1", COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], Self::row_to_repository)
            .optional()?)
    }

    /// 按 (类型, 路径) 查询，包含已软删除的仓库
    pub fn find_by_path(&self, repo_type: &str, path: &str) -> Result<Option<Repository>> {
        let sql = format!(
            "SELECT {} FROM repositories WHERE repository_type = ?1 AND path = ?2",
            COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let repo = stmt
            .query_row(params![repo_type, path], Self::row_to_repository)
            .optional()
            .map_err(|e| HubSyncError::Database(format!("查询仓库失败: {}", e)))?;
        Ok(repo)
    }

    /// 批量解析，不存在的路径直接跳过
    pub fn find_by_paths(&self, repo_type: &str, paths: &[String]) -> Result<Vec<Repository>> {
        let mut repos = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(repo) = self.find_by_path(repo_type, path)? {
                repos.push(repo);
            }
        }
        Ok(repos)
    }

    /// 按 (类型, 路径) 插入或更新，同时清除软删除标记，返回仓库 id
    pub fn upsert(&self, r: &RepositoryUpsert) -> Result<i64> {
        let now = now_string();
        let id = self
            .conn
            .query_row(
                "INSERT INTO repositories (
                    repository_type, path, name, nickname, description, license, private,
                    default_branch, source, sync_status, readme, downloads, likes, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
                 ON CONFLICT(repository_type, path) DO UPDATE SET
                    name = excluded.name,
                    nickname = excluded.nickname,
                    description = excluded.description,
                    license = excluded.license,
                    private = excluded.private,
                    default_branch = excluded.default_branch,
                    source = excluded.source,
                    sync_status = excluded.sync_status,
                    readme = excluded.readme,
                    downloads = excluded.downloads,
                    likes = excluded.likes,
                    deleted_at = NULL,
                    updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    r.repository_type,
                    r.path,
                    r.name,
                    r.nickname,
                    r.description,
                    r.license,
                    r.private,
                    r.default_branch,
                    r.source,
                    r.sync_status,
                    r.readme,
                    r.downloads,
                    r.likes,
                    now
                ],
                |row| row.get(0),
            )
            .map_err(|e| HubSyncError::Database(format!("写入仓库失败: {}", e)))?;
        Ok(id)
    }

    /// 不存在时创建一个空仓库，已存在时原样返回
    pub fn ensure(&self, repo_type: &str, path: &str, default_branch: &str, source: &str) -> Result<Repository> {
        if let Some(repo) = self.find_by_path(repo_type, path)? {
            return Ok(repo);
        }
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let id = self.upsert(&RepositoryUpsert {
            repository_type: repo_type.to_string(),
            path: path.to_string(),
            name,
            default_branch: default_branch.to_string(),
            source: source.to_string(),
            ..Default::default()
        })?;
        self.get(id)?
            .ok_or_else(|| HubSyncError::NotFound(format!("仓库 {} 写入后未找到", id)))
    }

    pub fn soft_delete(&self, repo_type: &str, path: &str) -> Result<bool> {
        let now = now_string();
        let n = self.conn.execute(
            "UPDATE repositories SET deleted_at = ?1, updated_at = ?1
             WHERE repository_type = ?2 AND path = ?3 AND deleted_at IS NULL",
            params![now, repo_type, path],
        )?;
        Ok(n > 0)
    }

    /// 整体替换文件列表
    pub fn replace_files(&self, repository_id: i64, files: &[RepoFile]) -> Result<()> {
        self.conn.execute(
            "DELETE FROM repository_files WHERE repository_id = ?1",
            params![repository_id],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR REPLACE INTO repository_files
                (repository_id, path, name, size, lfs, lfs_oid, last_commit_sha)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for f in files {
            stmt.execute(params![
                repository_id,
                f.path,
                f.name,
                f.size,
                f.lfs,
                f.lfs_oid,
                f.last_commit_sha
            ])
            .map_err(|e| HubSyncError::Database(format!("写入仓库文件失败: {}", e)))?;
        }
        Ok(())
    }

    pub fn list_files(&self, repository_id: i64) -> Result<Vec<RepoFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, name, size, lfs, lfs_oid, last_commit_sha FROM repository_files
             WHERE repository_id = ?1 ORDER BY path",
        )?;
        let files = stmt
            .query_map(params![repository_id], |row| {
                Ok(RepoFile {
                    path: row.get(0)?,
                    name: row.get(1)?,
                    size: row.get(2)?,
                    lfs: row.get(3)?,
                    lfs_oid: row.get(4)?,
                    last_commit_sha: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// 整体替换标签
    pub fn replace_tags(&self, repository_id: i64, tags: &[RepoTag]) -> Result<()> {
        self.conn.execute(
            "DELETE FROM repository_tags WHERE repository_id = ?1",
            params![repository_id],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO repository_tags (repository_id, name, category) VALUES (?1, ?2, ?3)",
        )?;
        for t in tags {
            stmt.execute(params![repository_id, t.name, t.category])?;
        }
        Ok(())
    }

    pub fn list_tags(&self, repository_id: i64) -> Result<Vec<RepoTag>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, category FROM repository_tags WHERE repository_id = ?1 ORDER BY category, name",
        )?;
        let tags = stmt
            .query_map(params![repository_id], |row| {
                Ok(RepoTag {
                    name: row.get(0)?,
                    category: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    fn row_to_repository(row: &Row) -> rusqlite::Result<Repository> {
        Ok(Repository {
            id: row.get(0)?,
            repository_type: row.get(1)?,
            path: row.get(2)?,
            name: row.get(3)?,
            nickname: row.get(4)?,
            description: row.get(5)?,
            license: row.get(6)?,
            private: row.get(7)?,
            default_branch: row.get(8)?,
            source: row.get(9)?,
            sync_status: row.get(10)?,
            readme: row.get(11)?,
            downloads: row.get(12)?,
            likes: row.get(13)?,
            deleted_at: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }
}
