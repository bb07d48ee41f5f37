//! KV 存储模块，基于 sled
//!
//! 每类数据一个 Tree，目前用于 LFS 传输断点。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{HubSyncError, Result};

/// 常用 Tree 名称
pub mod trees {
    /// LFS 对象传输断点，key = `{mirror_id}/{oid}`
    pub const LFS_CHECKPOINTS: &str = "lfs_checkpoints";
}

#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: PathBuf,
    db: Arc<Db>,
}

impl KvStore {
    /// 打开 `{base_path}/kv`；上一个进程刚退出时 sled 文件锁可能尚未释放，带退避重试
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| HubSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            HubSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        tracing::info!("KV 存储已打开: {}", kv_path.display());
        Ok(Self {
            base_path,
            db: Arc::new(db),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn tree(&self, name: &str) -> Result<Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| HubSyncError::KvStore(format!("打开 Tree {} 失败: {}", name, e)))
    }

    pub fn set<K, V>(&self, tree: &str, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| HubSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        self.tree(tree)?
            .insert(key, value_bytes)
            .map_err(|e| HubSyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    pub fn get<K, V>(&self, tree: &str, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self
            .tree(tree)?
            .get(key)
            .map_err(|e| HubSyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        match result {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| HubSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn exists<K: AsRef<[u8]>>(&self, tree: &str, key: K) -> Result<bool> {
        self.tree(tree)?
            .contains_key(key)
            .map_err(|e| HubSyncError::KvStore(format!("检查键存在失败: {}", e)))
    }

    pub fn delete<K: AsRef<[u8]>>(&self, tree: &str, key: K) -> Result<bool> {
        let removed = self
            .tree(tree)?
            .remove(key)
            .map_err(|e| HubSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    pub fn scan_prefix<V>(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();
        for item in self.tree(tree)?.scan_prefix(prefix) {
            let (key, bytes) =
                item.map_err(|e| HubSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| HubSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((key.to_vec(), value));
        }
        Ok(results)
    }

    /// 删除某个前缀下的所有键，返回删除数量
    pub fn remove_prefix(&self, tree: &str, prefix: &[u8]) -> Result<usize> {
        let tree = self.tree(tree)?;
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in tree.scan_prefix(prefix) {
            let (key, _) = item.map_err(|e| HubSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            batch.remove(key);
            count += 1;
        }
        tree.apply_batch(batch)
            .map_err(|e| HubSyncError::KvStore(format!("批量删除失败: {}", e)))?;
        Ok(count)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| HubSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}
