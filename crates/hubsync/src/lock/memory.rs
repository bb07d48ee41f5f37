//! 进程内锁实现，语义与 Redis 版一致（测试与单进程部署使用）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{acquire_with_backoff, new_holder_id, new_lease, DistributedLock, LockLease, LockOptions};
use crate::error::Result;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// 多个 MemoryLock 共享的锁表，clone 后指向同一张表
#[derive(Debug, Clone, Default)]
pub struct MemoryLockTable {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryLockTable {
    /// SET NX PX 语义；返回 None 表示成功，否则返回当前持有者
    fn set_nx(&self, key: &str, value: &str, lease: &LockLease) -> Option<String> {
        let mut table = self.inner.lock();
        let now = Instant::now();
        match table.get(key) {
            Some(e) if e.expires_at > now => Some(e.value.clone()),
            _ => {
                table.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: now + lease.expiry,
                    },
                );
                None
            }
        }
    }

    fn compare_and_delete(&self, lease: &LockLease) -> bool {
        let mut table = self.inner.lock();
        match table.get(&lease.key) {
            Some(e) if e.value == lease.value && e.expires_at > Instant::now() => {
                table.remove(&lease.key);
                true
            }
            _ => false,
        }
    }

    fn compare_and_expire(&self, lease: &LockLease) -> bool {
        let mut table = self.inner.lock();
        let now = Instant::now();
        match table.get_mut(&lease.key) {
            Some(e) if e.value == lease.value && e.expires_at > now => {
                e.expires_at = now + lease.expiry;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLock {
    table: MemoryLockTable,
    holder_id: String,
    opts: LockOptions,
}

impl MemoryLock {
    pub fn new(table: MemoryLockTable, opts: LockOptions) -> Self {
        Self {
            table,
            holder_id: new_holder_id(),
            opts,
        }
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_lock(&self, name: &str) -> Result<LockLease> {
        let lease = new_lease(name, &self.holder_id, self.opts.expiry);
        acquire_with_backoff(name, &self.opts, || {
            let holder = self.table.set_nx(&lease.key, &lease.value, &lease);
            async move { Ok(holder) }
        })
        .await?;
        Ok(lease)
    }

    async fn unlock(&self, lease: &LockLease) -> Result<bool> {
        Ok(self.table.compare_and_delete(lease))
    }

    async fn refresh(&self, lease: &LockLease) -> Result<bool> {
        Ok(self.table.compare_and_expire(lease))
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubSyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn opts(expiry_ms: u64) -> LockOptions {
        LockOptions {
            expiry: Duration::from_millis(expiry_ms),
            acquire_timeout: Duration::from_millis(30),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_second_holder_gets_lock_held() {
        let table = MemoryLockTable::default();
        let a = MemoryLock::new(table.clone(), opts(60_000));
        let b = MemoryLock::new(table, opts(60_000));

        let lease = a.try_lock("acct-metering").await.unwrap();
        assert!(lease.value.starts_with(a.holder_id()));
        let err = b.try_lock("acct-metering").await.unwrap_err();
        assert!(matches!(err, HubSyncError::LockHeld { .. }));
        assert!(err.is_contention());

        // 别人的 lease 不能释放
        let forged = LockLease { value: format!("{}:x", b.holder_id()), ..lease.clone() };
        assert!(!b.unlock(&forged).await.unwrap());
        assert!(a.unlock(&lease).await.unwrap());
        assert!(!a.unlock(&lease).await.unwrap());
        assert!(b.try_lock("acct-metering").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let table = MemoryLockTable::default();
        let a = MemoryLock::new(table.clone(), opts(20));
        let b = MemoryLock::new(table, opts(20));
        let lease = a.try_lock("n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!a.refresh(&lease).await.unwrap());
        let taken = b.try_lock("n").await.unwrap();
        assert!(!a.unlock(&lease).await.unwrap());
        assert!(b.refresh(&taken).await.unwrap());
    }

    /// 同一时刻最多一个持有者
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        let table = MemoryLockTable::default();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = MemoryLock::new(
                table.clone(),
                LockOptions {
                    expiry: Duration::from_secs(60),
                    acquire_timeout: Duration::from_secs(5),
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(5),
                },
            );
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let acquired = acquired.clone();
            handles.push(tokio::spawn(async move {
                let lease = lock.try_lock("shared").await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(3)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                acquired.fetch_add(1, Ordering::SeqCst);
                assert!(lock.unlock(&lease).await.unwrap());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(acquired.load(Ordering::SeqCst), 8);
    }
}
