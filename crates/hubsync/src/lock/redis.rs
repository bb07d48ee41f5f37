//! 基于 Redis 的分布式锁
//!
//! - 加锁：`SET key value NX PX expiry`
//! - 解锁：Lua 比较后删除
//! - 续期：Lua 比较后 PEXPIRE

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use super::{acquire_with_backoff, new_holder_id, new_lease, DistributedLock, LockLease, LockOptions};
use crate::config::LockConfig;
use crate::error::{HubSyncError, Result};

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

fn set_nx_cmd(lease: &LockLease) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(&lease.key)
        .arg(&lease.value)
        .arg("NX")
        .arg("PX")
        .arg(lease.expiry.as_millis() as u64);
    cmd
}

#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    holder_id: String,
    opts: LockOptions,
}

impl std::fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock")
            .field("holder_id", &self.holder_id)
            .field("opts", &self.opts)
            .finish()
    }
}

impl RedisLock {
    pub async fn connect(config: &LockConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| HubSyncError::Config(format!("无效的 Redis 地址 {}: {}", config.redis_url, e)))?;
        let conn = tokio::time::timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| HubSyncError::Timeout(format!("连接 Redis {} 超时", config.redis_url)))??;
        let lock = Self {
            conn,
            holder_id: new_holder_id(),
            opts: LockOptions::from(config),
        };
        info!("✅ Redis 分布式锁已就绪: holder={}", lock.holder_id);
        Ok(lock)
    }

    /// 一次 SET NX PX；成功返回 None，否则返回当前持有者
    async fn set_nx(&self, lease: &LockLease) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let ok: Option<String> = set_nx_cmd(lease).query_async(&mut conn).await?;
        if ok.is_some() {
            return Ok(None);
        }
        let holder: Option<String> = redis::cmd("GET").arg(&lease.key).query_async(&mut conn).await?;
        Ok(Some(holder.unwrap_or_default()))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, name: &str) -> Result<LockLease> {
        let lease = new_lease(name, &self.holder_id, self.opts.expiry);
        acquire_with_backoff(name, &self.opts, || self.set_nx(&lease)).await?;
        Ok(lease)
    }

    async fn unlock(&self, lease: &LockLease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(UNLOCK_SCRIPT)
            .key(&lease.key)
            .arg(&lease.value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn refresh(&self, lease: &LockLease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = Script::new(REFRESH_SCRIPT)
            .key(&lease.key)
            .arg(&lease.value)
            .arg(lease.expiry.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &redis::Cmd) -> Vec<String> {
        cmd.args_iter()
            .filter_map(|a| match a {
                redis::Arg::Simple(b) => Some(String::from_utf8_lossy(b).into_owned()),
                redis::Arg::Cursor => None,
            })
            .collect()
    }

    #[test]
    fn test_set_nx_argument_order() {
        let lease = new_lease("mirror-progress-check", "host:1:abc", Duration::from_secs(8));
        assert_eq!(
            args(&set_nx_cmd(&lease)),
            vec![
                "SET".to_string(),
                "hubsync:lock:mirror-progress-check".to_string(),
                lease.value.clone(),
                "NX".to_string(),
                "PX".to_string(),
                "8000".to_string(),
            ]
        );
    }

    #[test]
    fn test_scripts_compare_holder_before_acting() {
        // KEYS[1] 为锁键，ARGV[1] 为持有者值，ARGV[2] 为续期毫秒数
        let guard = r#"redis.call("GET", KEYS[1]) == ARGV[1]"#;
        assert!(UNLOCK_SCRIPT.contains(guard));
        assert!(UNLOCK_SCRIPT.contains(r#"redis.call("DEL", KEYS[1])"#));
        assert!(REFRESH_SCRIPT.contains(guard));
        assert!(REFRESH_SCRIPT.contains(r#"redis.call("PEXPIRE", KEYS[1], ARGV[2])"#));
    }
}
