//! 存储层
//!
//! - `Database`：SQLite 连接（多个进程可共享同一个文件，跨进程互斥靠 `BEGIN IMMEDIATE`）
//! - `dao`：每张表一个 DAO
//! - `kv`：sled 键值存储（LFS 传输断点）

pub mod dao;
pub mod entities;
pub mod kv;
pub mod migrate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{HubSyncError, Result};

/// SQLite 数据库句柄，clone 共享同一个连接
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// 打开（必要时创建）数据库文件并执行 migrations
    pub async fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| HubSyncError::IO(format!("创建数据库目录失败: {}", e)))?;
            }
        }
        let mut conn = Connection::open(path)
            .map_err(|e| HubSyncError::Database(format!("打开数据库失败: {}", e)))?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))
            .map_err(|e| HubSyncError::Database(format!("设置 busy_timeout 失败: {}", e)))?;
        migrate::init_db(&mut conn)?;

        info!("✅ 数据库已打开: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// 内存数据库，仅用于测试与一次性命令
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| HubSyncError::Database(format!("打开内存数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 在连接上执行一段同步的数据库操作
    pub async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}
