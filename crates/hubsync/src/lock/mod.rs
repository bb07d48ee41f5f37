//! 分布式互斥锁
//!
//! 多个实例中只有一个执行对账等周期性扫描。竞争失败是预期行为：
//! `with_lock` 在竞争时返回 `Ok(None)` 并只记 debug 日志。
//! 持锁期间每过 1/3 过期时间续期一次，扫描耗时超过过期时间也不会丢锁。

pub mod memory;
pub mod redis;

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{HubSyncError, Result};

pub use self::memory::{MemoryLock, MemoryLockTable};
pub use self::redis::RedisLock;

/// 锁的键前缀
pub const LOCK_KEY_PREFIX: &str = "hubsync:lock:";

/// 一次成功加锁的凭证，解锁与续期都要出示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub key: String,
    /// `{holder_id}:{nonce}`
    pub value: String,
    pub expiry: Duration,
}

/// 加锁时序参数
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub expiry: Duration,
    pub acquire_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(c: &LockConfig) -> Self {
        Self {
            expiry: Duration::from_millis(c.expiry_ms),
            acquire_timeout: Duration::from_millis(c.acquire_timeout_ms),
            initial_backoff: Duration::from_millis(c.initial_backoff_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
        }
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync + Debug {
    /// 在 acquire_timeout 内尝试加锁，超时返回 `LockHeld`
    async fn try_lock(&self, name: &str) -> Result<LockLease>;

    /// 仅当锁仍由该 lease 持有时删除，返回是否真的释放了
    async fn unlock(&self, lease: &LockLease) -> Result<bool>;

    /// 仅当锁仍由该 lease 持有时重置过期时间
    async fn refresh(&self, lease: &LockLease) -> Result<bool>;

    fn holder_id(&self) -> &str;
}

/// `{hostname}:{pid}:{uuid}`
pub fn new_holder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}:{}", host, std::process::id(), uuid::Uuid::new_v4())
}

pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, name)
}

pub(crate) fn new_lease(name: &str, holder_id: &str, expiry: Duration) -> LockLease {
    LockLease {
        name: name.to_string(),
        key: lock_key(name),
        value: format!("{}:{}", holder_id, uuid::Uuid::new_v4().simple()),
        expiry,
    }
}

/// 带抖动的指数退避重试；attempt 返回 `Ok(None)` 表示拿到锁，`Ok(Some(holder))` 表示被占用
pub(crate) async fn acquire_with_backoff<F, Fut>(name: &str, opts: &LockOptions, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    let deadline = Instant::now() + opts.acquire_timeout;
    let mut backoff_ms = opts.initial_backoff.as_millis().max(1) as u64;
    let max_backoff_ms = opts.max_backoff.as_millis().max(1) as u64;

    loop {
        let holder = match attempt().await? {
            None => return Ok(()),
            Some(holder) => holder,
        };

        if Instant::now() >= deadline {
            return Err(HubSyncError::LockHeld {
                name: name.to_string(),
                holder: Some(holder).filter(|h| !h.is_empty()),
            });
        }

        let jitter = rand::thread_rng().gen_range(0..backoff_ms / 2 + 1);
        let sleep_ms = backoff_ms + jitter;
        debug!(lock = %name, holder = %holder, backoff_ms = sleep_ms, "锁被占用，退避重试");
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;

        backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
    }
}

/// 持锁执行 f；锁被占用时返回 `Ok(None)`，执行结束后总是尝试释放
pub async fn with_lock<L, F, Fut, T>(lock: &L, name: &str, f: F) -> Result<Option<T>>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease = match lock.try_lock(name).await {
        Ok(lease) => lease,
        Err(e) if e.is_contention() => {
            debug!("锁 {} 已被其他实例持有，跳过本轮: {}", name, e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let result = hold_while(lock, &lease, f()).await;

    match lock.unlock(&lease).await {
        Ok(true) => {}
        Ok(false) => warn!("释放锁 {} 时已不再持有（可能已过期）", name),
        Err(e) => warn!("释放锁 {} 失败: {}", name, e),
    }

    result.map(Some)
}

/// 驱动 work 直到完成，期间定期续期 lease
async fn hold_while<L, Fut, T>(lock: &L, lease: &LockLease, work: Fut) -> Result<T>
where
    L: DistributedLock + ?Sized,
    Fut: Future<Output = Result<T>>,
{
    tokio::pin!(work);
    let period = (lease.expiry / 3).max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut work => return result,
            _ = ticker.tick() => match lock.refresh(lease).await {
                Ok(true) => debug!(lock = %lease.name, "锁已续期"),
                Ok(false) => warn!("续期锁 {} 时已不再持有", lease.name),
                Err(e) => warn!("续期锁 {} 失败: {}", lease.name, e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_opts() -> LockOptions {
        LockOptions {
            expiry: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_holder_id_shape() {
        let id = new_holder_id();
        let parts: Vec<&str> = id.rsplitn(3, ':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], std::process::id().to_string());
        assert_ne!(new_holder_id(), id);
        assert_eq!(lock_key("create-push-mirror"), "hubsync:lock:create-push-mirror");
    }

    #[tokio::test]
    async fn test_backoff_gives_up_with_holder() {
        let calls = AtomicUsize::new(0);
        let err = acquire_with_backoff("x", &fast_opts(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some("other".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(calls.load(Ordering::SeqCst) > 1);
        match err {
            HubSyncError::LockHeld { holder, .. } => assert_eq!(holder.as_deref(), Some("other")),
            e => panic!("unexpected: {}", e),
        }
    }

    #[tokio::test]
    async fn test_with_lock_skips_on_contention() {
        let table = MemoryLockTable::default();
        let a = MemoryLock::new(table.clone(), fast_opts());
        let b = MemoryLock::new(table, fast_opts());

        let held = a.try_lock("mirror-progress-check").await.unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let out = with_lock(&b, "mirror-progress-check", || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert!(out.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        assert!(a.unlock(&held).await.unwrap());
        let out = with_lock(&b, "mirror-progress-check", || async { Ok(7) }).await.unwrap();
        assert_eq!(out, Some(7));
        // with_lock 结束后锁已释放
        assert!(a.try_lock("mirror-progress-check").await.is_ok());
    }

    #[tokio::test]
    async fn test_with_lock_keeps_lease_past_expiry() {
        let table = MemoryLockTable::default();
        let short = LockOptions {
            expiry: Duration::from_millis(60),
            acquire_timeout: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(5),
        };
        let a = MemoryLock::new(table.clone(), short.clone());
        let b = MemoryLock::new(table, short);

        let out = with_lock(&a, "mirror-progress-check", || async {
            // 执行时间超过两倍过期时间
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(b.try_lock("mirror-progress-check").await.is_err())
        })
        .await
        .unwrap();
        assert_eq!(out, Some(true));
        assert!(b.try_lock("mirror-progress-check").await.is_ok());
    }

    #[tokio::test]
    async fn test_with_lock_propagates_inner_error_and_unlocks() {
        let lock = MemoryLock::new(MemoryLockTable::default(), fast_opts());
        let out: Result<Option<()>> = with_lock(&lock, "n", || async {
            Err(HubSyncError::Other("scan failed".into()))
        })
        .await;
        assert!(out.is_err());
        assert!(lock.try_lock("n").await.is_ok());
    }
}
