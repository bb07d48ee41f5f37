use std::fmt;
use rusqlite;

#[derive(Debug)]
pub enum HubSyncError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    IO(String),
    Database(String),
    Migration(String),
    KvStore(String),
    Serialization(String),
    Transport(String), // 网络层错误
    Http {
        status: u16,
        message: String,
    },
    Timeout(String),
    Config(String), // 配置错误，启动阶段即失败
    NotFound(String),
    InvalidArgument(String),
    InvalidData(String),
    UnknownRepoType(String),
    InvalidTransition {
        from: String,
        event: String,
    },
    // 锁已被其他实例持有（预期内的竞争）
    LockHeld {
        name: String,
        holder: Option<String>,
    },
    Bus(String),
    NotSupported(String),
    Git(String),
    Auth(String),
    UpstreamGone(String), // 上游仓库已删除
    QuotaRejected(String),
    Cancelled(String),
    // 进程退出打断了任务，任务本身未被取消
    Interrupted(String),
    Other(String),
}

/// 错误分类，决定调用方的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 锁竞争：跳过本轮，不记为错误
    Contention,
    /// 瞬时错误：按退避策略重试
    Transient,
    /// 数据不一致：跳过该条，继续处理剩余批次
    DataInconsistency,
    /// 致命配置错误：阻止进程启动
    FatalConfig,
    /// 配额拒绝：返回给调用方，不自动重试
    QuotaRejection,
    /// 被取消
    Cancelled,
    /// 不可重试的永久错误
    Permanent,
}

impl fmt::Display for HubSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubSyncError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            HubSyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            HubSyncError::IO(e) => write!(f, "IO error: {}", e),
            HubSyncError::Database(e) => write!(f, "Database error: {}", e),
            HubSyncError::Migration(e) => write!(f, "Migration error: {}", e),
            HubSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            HubSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            HubSyncError::Transport(e) => write!(f, "Transport error: {}", e),
            HubSyncError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            HubSyncError::Timeout(e) => write!(f, "Timeout: {}", e),
            HubSyncError::Config(e) => write!(f, "Config error: {}", e),
            HubSyncError::NotFound(e) => write!(f, "Not found: {}", e),
            HubSyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            HubSyncError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            HubSyncError::UnknownRepoType(t) => write!(f, "Unknown repo type: {}", t),
            HubSyncError::InvalidTransition { from, event } => {
                write!(f, "Invalid transition: event '{}' from status '{}'", event, from)
            }
            HubSyncError::LockHeld { name, holder } => match holder {
                Some(h) => write!(f, "Lock '{}' already held by {}", name, h),
                None => write!(f, "Lock '{}' already held", name),
            },
            HubSyncError::Bus(e) => write!(f, "Bus error: {}", e),
            HubSyncError::NotSupported(e) => write!(f, "Operation not supported: {}", e),
            HubSyncError::Git(e) => write!(f, "Git error: {}", e),
            HubSyncError::Auth(e) => write!(f, "Authentication error: {}", e),
            HubSyncError::UpstreamGone(e) => write!(f, "Upstream repository gone: {}", e),
            HubSyncError::QuotaRejected(e) => write!(f, "Quota rejected: {}", e),
            HubSyncError::Cancelled(e) => write!(f, "Cancelled: {}", e),
            HubSyncError::Interrupted(e) => write!(f, "Interrupted: {}", e),
            HubSyncError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for HubSyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HubSyncError::SqliteError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for HubSyncError {
    fn from(error: rusqlite::Error) -> Self {
        HubSyncError::SqliteError(error)
    }
}

impl From<serde_json::Error> for HubSyncError {
    fn from(error: serde_json::Error) -> Self {
        HubSyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for HubSyncError {
    fn from(error: std::io::Error) -> Self {
        HubSyncError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for HubSyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            HubSyncError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            HubSyncError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            HubSyncError::Transport(error.to_string())
        }
    }
}

impl From<redis::RedisError> for HubSyncError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_timeout() {
            HubSyncError::Timeout(format!("redis: {}", error))
        } else {
            HubSyncError::Transport(format!("redis: {}", error))
        }
    }
}

impl From<csv::Error> for HubSyncError {
    fn from(error: csv::Error) -> Self {
        if error.is_io_error() {
            HubSyncError::IO(format!("csv: {}", error))
        } else {
            HubSyncError::InvalidData(format!("csv: {}", error))
        }
    }
}

impl From<tokio::time::error::Elapsed> for HubSyncError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        HubSyncError::Timeout(error.to_string())
    }
}

impl HubSyncError {
    /// 按来源归类错误
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubSyncError::LockHeld { .. } => ErrorKind::Contention,
            HubSyncError::Transport(_)
            | HubSyncError::Timeout(_)
            | HubSyncError::Bus(_)
            | HubSyncError::KvStore(_) => ErrorKind::Transient,
            HubSyncError::Http { status, .. } => {
                if *status >= 500 || *status == 429 {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            HubSyncError::SqliteError(e) => {
                if is_busy(e) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            HubSyncError::Database(msg) => {
                if msg.contains("locked") || msg.contains("busy") {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            HubSyncError::Git(msg) => {
                let msg = msg.to_lowercase();
                if msg.contains("rate limit")
                    || msg.contains("timed out")
                    || msg.contains("could not resolve host")
                    || msg.contains("connection")
                    || msg.contains("early eof")
                {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            HubSyncError::InvalidData(_)
            | HubSyncError::UnknownRepoType(_)
            | HubSyncError::JsonError(_) => ErrorKind::DataInconsistency,
            HubSyncError::Config(_) => ErrorKind::FatalConfig,
            HubSyncError::QuotaRejected(_) => ErrorKind::QuotaRejection,
            HubSyncError::Cancelled(_) | HubSyncError::Interrupted(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Permanent,
        }
    }

    /// 是否值得按退避策略重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// 是否是锁竞争（预期内，调用方应静默跳过）
    pub fn is_contention(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub type Result<T> = std::result::Result<T, HubSyncError>;
