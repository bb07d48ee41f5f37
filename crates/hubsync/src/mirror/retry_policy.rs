use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, HubSyncError};

/// 镜像失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 上游服务端错误
    ServerError(u16),
    /// 上游限流 - 延迟重试
    RateLimited,
    /// 本地数据库忙
    StorageBusy,
    /// 凭证无效 - 不重试
    AuthFailure,
    /// 上游仓库已删除 - 不重试
    UpstreamGone,
    /// 其他永久错误
    Permanent(String),
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::NetworkTimeout
            | FailureReason::NetworkUnavailable
            | FailureReason::RateLimited
            | FailureReason::StorageBusy => true,
            FailureReason::ServerError(code) => *code >= 500 || *code == 429,
            FailureReason::AuthFailure | FailureReason::UpstreamGone | FailureReason::Permanent(_) => false,
        }
    }

    /// 重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            FailureReason::NetworkTimeout => 1.0,
            FailureReason::NetworkUnavailable => 2.0,
            FailureReason::ServerError(_) => 1.5,
            FailureReason::RateLimited => 3.0, // 限流需要更长延迟
            FailureReason::StorageBusy => 0.5,
            _ => 1.0,
        }
    }
}

impl From<&HubSyncError> for FailureReason {
    fn from(error: &HubSyncError) -> Self {
        match error {
            HubSyncError::Timeout(_) => FailureReason::NetworkTimeout,
            HubSyncError::Transport(_) | HubSyncError::Bus(_) => FailureReason::NetworkUnavailable,
            HubSyncError::Http { status: 429, .. } => FailureReason::RateLimited,
            HubSyncError::Http { status, .. } if *status >= 500 => FailureReason::ServerError(*status),
            HubSyncError::Http { status: 401 | 403, .. } | HubSyncError::Auth(_) => FailureReason::AuthFailure,
            HubSyncError::Http { status: 404 | 410, .. } | HubSyncError::UpstreamGone(_) => {
                FailureReason::UpstreamGone
            }
            HubSyncError::Git(msg) if msg.to_lowercase().contains("rate limit") => FailureReason::RateLimited,
            e => match e.kind() {
                ErrorKind::Transient if matches!(e, HubSyncError::SqliteError(_) | HubSyncError::Database(_)) => {
                    FailureReason::StorageBusy
                }
                ErrorKind::Transient => FailureReason::NetworkUnavailable,
                _ => FailureReason::Permanent(e.to_string()),
            },
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_seconds: 1,
            max_delay_seconds: 300,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// 第 retry_count 次重试前的等待时间；不可重试或次数用尽时返回 None
    pub fn next_delay(&self, retry_count: u32, reason: &FailureReason) -> Option<Duration> {
        if !self.should_retry(retry_count, reason) {
            return None;
        }

        let exp = retry_count.saturating_sub(1) as f64;
        let base_delay = self.base_delay_seconds as f64 * self.backoff_factor.powf(exp);
        let adjusted = base_delay * reason.delay_multiplier();
        let capped = adjusted.min(self.max_delay_seconds as f64);

        // ±jitter_factor/2 的随机抖动
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let delay = (capped + jitter).clamp(0.0, self.max_delay_seconds as f64);
        Some(Duration::from_secs_f64(delay))
    }

    /// retry_count 为已经发生的失败次数（含本次）
    pub fn should_retry(&self, retry_count: u32, reason: &FailureReason) -> bool {
        retry_count <= self.max_retries && reason.is_retryable()
    }
}
