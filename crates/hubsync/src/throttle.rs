//! 令牌桶限流
//!
//! - 任务派发限速：`mirror.rate_limit` 个/秒，突发 `mirror.rate_bucket_capacity`
//! - LFS 下载带宽：`max_bandwidth` 字节/秒

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// 令牌桶
#[derive(Debug)]
pub struct TokenBucket {
    /// 令牌容量
    capacity: f64,
    /// 当前令牌数
    tokens: f64,
    /// 每秒补充的令牌数
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity, // 初始满令牌
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// 尝试消耗指定数量的令牌
    ///
    /// 返回：(是否成功, 需要等待的时间)
    pub fn try_consume(&mut self, tokens_needed: f64) -> (bool, Option<Duration>) {
        self.refill();

        if self.tokens >= tokens_needed {
            self.tokens -= tokens_needed;
            (true, None)
        } else {
            let deficit = tokens_needed - self.tokens;
            let wait = if self.refill_rate > 0.0 {
                Duration::from_secs_f64(deficit / self.refill_rate)
            } else {
                Duration::from_secs(1)
            };
            (false, Some(wait))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    #[error("触发限流，需要等待 {wait:?}")]
    Exceeded { wait: Duration },
}

/// 可在多个任务间共享的限流器；`None` 表示不限速
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<Mutex<TokenBucket>>>,
    name: &'static str,
}

impl RateLimiter {
    /// rate <= 0 时不限速
    pub fn new(name: &'static str, rate: f64, capacity: f64) -> Self {
        let bucket = if rate > 0.0 {
            Some(Arc::new(Mutex::new(TokenBucket::new(capacity.max(1.0), rate))))
        } else {
            None
        };
        Self { bucket, name }
    }

    pub fn unlimited(name: &'static str) -> Self {
        Self { bucket: None, name }
    }

    /// 带宽限速：每秒 bytes_per_sec 字节，突发一秒的量
    pub fn bandwidth(bytes_per_sec: u64) -> Self {
        Self::new("bandwidth", bytes_per_sec as f64, bytes_per_sec as f64)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    pub fn try_acquire(&self, n: f64) -> Result<(), RateLimitError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };
        let (ok, wait) = bucket.lock().try_consume(n);
        if ok {
            Ok(())
        } else {
            Err(RateLimitError::Exceeded {
                wait: wait.unwrap_or(Duration::from_millis(100)),
            })
        }
    }

    /// 等待直到拿到 n 个令牌；n 超过容量时分段获取
    pub async fn acquire(&self, n: f64) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let capacity = bucket.lock().capacity();
        let mut remaining = n;
        while remaining > 0.0 {
            let chunk = remaining.min(capacity);
            loop {
                let (ok, wait) = bucket.lock().try_consume(chunk);
                if ok {
                    break;
                }
                let wait = wait.unwrap_or(Duration::from_millis(100));
                debug!("{} 限流，等待 {}ms", self.name, wait.as_millis());
                tokio::time::sleep(wait).await;
            }
            remaining -= chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket() {
        let mut bucket = TokenBucket::new(10.0, 5.0);
        assert!((bucket.available_tokens() - 10.0).abs() < 0.1);

        let (ok, _) = bucket.try_consume(5.0);
        assert!(ok);
        let (ok, _) = bucket.try_consume(5.0);
        assert!(ok);

        let (ok, wait) = bucket.try_consume(5.0);
        assert!(!ok);
        let wait = wait.unwrap();
        assert!(wait > Duration::from_millis(500) && wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_unlimited_never_blocks() {
        let limiter = RateLimiter::new("dispatch", 0.0, 5.0);
        assert!(limiter.is_unlimited());
        for _ in 0..1000 {
            assert!(limiter.try_acquire(1.0).is_ok());
        }
    }

    #[test]
    fn test_try_acquire_reports_wait() {
        let limiter = RateLimiter::new("dispatch", 1.0, 2.0);
        assert!(limiter.try_acquire(1.0).is_ok());
        assert!(limiter.try_acquire(1.0).is_ok());
        assert!(matches!(limiter.try_acquire(1.0), Err(RateLimitError::Exceeded { .. })));
    }

    #[tokio::test]
    async fn test_acquire_larger_than_capacity() {
        let limiter = RateLimiter::bandwidth(1000);
        let start = Instant::now();
        limiter.acquire(1300.0).await;
        // 1000 个令牌初始可用，剩下 300 需要约 0.3 秒
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
