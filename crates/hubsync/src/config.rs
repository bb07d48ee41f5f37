//! 运行配置
//!
//! 加载顺序：默认值 → TOML 文件 → `HUBSYNC_*` 环境变量覆盖 → `validate()`。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::HubSyncError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path} 失败: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("解析配置文件失败: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("环境变量 {key} 的值无效: {value}")]
    InvalidEnv { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for HubSyncError {
    fn from(e: ConfigError) -> Self {
        HubSyncError::Config(e.to_string())
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite 数据库文件路径
    pub db_path: PathBuf,
    /// sled KV 目录（LFS 传输断点）
    pub kv_path: PathBuf,
    /// SQLite busy_timeout（毫秒）
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/hubsync.db"),
            kv_path: PathBuf::from("./data"),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    Redis,
    Memory,
}

/// 分布式锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub redis_url: String,
    /// 锁自动过期时间（毫秒）
    pub expiry_ms: u64,
    /// 获取锁的总等待时间（毫秒）
    pub acquire_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            expiry_ms: 60_000,
            acquire_timeout_ms: 1_000,
            initial_backoff_ms: 10,
            max_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    Nats,
    RedisStream,
    Memory,
}

/// 消息总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub nats_url: String,
    pub redis_url: String,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 断线重连间隔（秒）
    pub reconnect_wait_secs: u64,
    /// 发布与管理类请求超时（秒）
    pub request_timeout_secs: u64,
    /// 未 ack 消息重新投递前的等待时间（秒）
    pub ack_wait_secs: u64,
    /// 默认最大投递次数
    pub max_deliver: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Nats,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout_secs: 2,
            reconnect_wait_secs: 10,
            request_timeout_secs: 30,
            ack_wait_secs: 30,
            max_deliver: 2,
        }
    }
}

/// 同步过滤配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// 允许同步的 namespace 白名单，为空表示不限制
    pub namespaces: Vec<String>,
}

/// 多实例拉取同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub multi_sync_enabled: bool,
    /// 源站地址，如 https://hub.example.com
    pub origin_endpoint: String,
    /// 源站 token，sync_client_settings 中有记录时优先使用后者
    pub token: String,
    pub latest_timeout_secs: u64,
    pub info_timeout_secs: u64,
    pub filter: FilterConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            multi_sync_enabled: false,
            origin_endpoint: String::new(),
            token: String::new(),
            latest_timeout_secs: 60,
            info_timeout_secs: 10,
            filter: FilterConfig::default(),
        }
    }
}

/// 镜像任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// 仓库同步 worker 数
    pub worker_number: usize,
    /// LFS 同步 worker 数
    pub lfs_worker_number: usize,
    /// 每秒派发任务数
    pub rate_limit: f64,
    /// 令牌桶容量
    pub rate_bucket_capacity: f64,
    /// 队列为空时的轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// 瞬时错误最大重试次数
    pub max_retries: u32,
    /// 对账间隔（秒）
    pub reconcile_interval_secs: u64,
    /// 执行中任务的心跳租约（秒），超时未续约的任务由对账退回
    pub task_lease_secs: u64,
    /// 裸仓库根目录
    pub repos_root: PathBuf,
    /// LFS 对象根目录
    pub lfs_root: PathBuf,
    pub git_binary: String,
    /// 单个 git 命令超时（秒）
    pub git_timeout_secs: u64,
    /// 源站对应的 mirror_sources.source_name
    pub origin_source_name: String,
    /// 默认 LFS 下载带宽上限（字节/秒），0 表示不限
    pub lfs_max_bandwidth: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            worker_number: 5,
            lfs_worker_number: 5,
            rate_limit: 1.0,
            rate_bucket_capacity: 5.0,
            poll_interval_secs: 5,
            max_retries: 5,
            reconcile_interval_secs: 300,
            task_lease_secs: 600,
            repos_root: PathBuf::from("./data/repos"),
            lfs_root: PathBuf::from("./data/lfs"),
            git_binary: "git".to_string(),
            git_timeout_secs: 3600,
            origin_source_name: "opencsg".to_string(),
            lfs_max_bandwidth: 0,
        }
    }
}

/// 计费服务配置（多实例同步配额）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_token: String,
    /// 同步时代表的用户
    pub current_user: String,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://127.0.0.1:8086".to_string(),
            api_token: String::new(),
            current_user: "root".to_string(),
        }
    }
}

/// 运行时特性开关
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub saas: bool,
    pub push_mirror: bool,
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// hubsync 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub storage: StorageConfig,
    pub lock: LockConfig,
    pub bus: BusConfig,
    pub sync: SyncConfig,
    pub mirror: MirrorConfig,
    pub accounting: AccountingConfig,
    pub features: FeatureFlags,
    pub http: HttpConfig,
}

impl HubConfig {
    /// 从 TOML 文件加载；path 为 None 时使用默认配置。随后应用环境变量覆盖。
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> std::result::Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// 应用 `HUBSYNC_*` 覆盖；lookup 便于测试注入
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HUBSYNC_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HUBSYNC_KV_PATH") {
            self.storage.kv_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HUBSYNC_REDIS_URL") {
            self.lock.redis_url = v.clone();
            self.bus.redis_url = v;
        }
        if let Some(v) = lookup("HUBSYNC_NATS_URL") {
            self.bus.nats_url = v;
        }
        if let Some(v) = lookup("HUBSYNC_BUS_BACKEND") {
            self.bus.backend = match v.as_str() {
                "nats" => BusBackend::Nats,
                "redis_stream" => BusBackend::RedisStream,
                "memory" => BusBackend::Memory,
                _ => return Err(invalid_env("HUBSYNC_BUS_BACKEND", &v)),
            };
        }
        if let Some(v) = lookup("HUBSYNC_LOCK_BACKEND") {
            self.lock.backend = match v.as_str() {
                "redis" => LockBackend::Redis,
                "memory" => LockBackend::Memory,
                _ => return Err(invalid_env("HUBSYNC_LOCK_BACKEND", &v)),
            };
        }
        if let Some(v) = lookup("HUBSYNC_MULTI_SYNC_ENABLED") {
            self.sync.multi_sync_enabled = parse_bool("HUBSYNC_MULTI_SYNC_ENABLED", &v)?;
        }
        if let Some(v) = lookup("HUBSYNC_SYNC_ENDPOINT") {
            self.sync.origin_endpoint = v;
        }
        if let Some(v) = lookup("HUBSYNC_SYNC_TOKEN") {
            self.sync.token = v;
        }
        if let Some(v) = lookup("HUBSYNC_ACCOUNTING_ENABLED") {
            self.accounting.enabled = parse_bool("HUBSYNC_ACCOUNTING_ENABLED", &v)?;
        }
        if let Some(v) = lookup("HUBSYNC_ACCOUNTING_ENDPOINT") {
            self.accounting.endpoint = v;
        }
        if let Some(v) = lookup("HUBSYNC_API_TOKEN") {
            self.accounting.api_token = v;
        }
        if let Some(v) = lookup("HUBSYNC_SAAS") {
            self.features.saas = parse_bool("HUBSYNC_SAAS", &v)?;
        }
        if let Some(v) = lookup("HUBSYNC_PUSH_MIRROR") {
            self.features.push_mirror = parse_bool("HUBSYNC_PUSH_MIRROR", &v)?;
        }
        if let Some(v) = lookup("HUBSYNC_MIRROR_WORKERS") {
            self.mirror.worker_number = v
                .parse()
                .map_err(|_| invalid_env("HUBSYNC_MIRROR_WORKERS", &v))?;
        }
        if let Some(v) = lookup("HUBSYNC_LFS_WORKERS") {
            self.mirror.lfs_worker_number = v
                .parse()
                .map_err(|_| invalid_env("HUBSYNC_LFS_WORKERS", &v))?;
        }
        Ok(())
    }

    /// 启动前校验，任何一项不满足都视为致命配置错误
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.storage.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.db_path 不能为空".to_string()));
        }
        if self.sync.multi_sync_enabled {
            if self.sync.origin_endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "已开启多实例同步但未配置 sync.origin_endpoint".to_string(),
                ));
            }
            if self.sync.token.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "已开启多实例同步但未配置 sync.token".to_string(),
                ));
            }
        }
        if self.accounting.enabled && self.accounting.api_token.len() < 32 {
            return Err(ConfigError::Invalid(
                "accounting.api_token 长度至少 32 个字符".to_string(),
            ));
        }
        if self.mirror.worker_number == 0 || self.mirror.lfs_worker_number == 0 {
            return Err(ConfigError::Invalid("worker 数量必须大于 0".to_string()));
        }
        if self.mirror.task_lease_secs == 0 {
            return Err(ConfigError::Invalid("mirror.task_lease_secs 必须大于 0".to_string()));
        }
        if self.features.push_mirror && !self.features.saas {
            return Err(ConfigError::Invalid(
                "push_mirror 仅在 SaaS 模式下可用".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid_env(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid_env(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock.expiry_ms, 60_000);
        assert_eq!(config.bus.max_deliver, 2);

        let mut no_lease = HubConfig::default();
        no_lease.mirror.task_lease_secs = 0;
        assert!(no_lease.validate().is_err());
    }

    #[test]
    fn test_toml_partial_override() {
        let raw = r#"
            [mirror]
            worker_number = 2

            [bus]
            backend = "redis_stream"

            [sync.filter]
            namespaces = ["opencsg"]
        "#;
        let config = HubConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.mirror.worker_number, 2);
        assert_eq!(config.mirror.lfs_worker_number, 5);
        assert_eq!(config.bus.backend, BusBackend::RedisStream);
        assert_eq!(config.sync.filter.namespaces, vec!["opencsg".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HUBSYNC_BUS_BACKEND", "memory"),
            ("HUBSYNC_SAAS", "true"),
            ("HUBSYNC_MIRROR_WORKERS", "8"),
        ]
        .into_iter()
        .collect();
        let mut config = HubConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bus.backend, BusBackend::Memory);
        assert!(config.features.saas);
        assert_eq!(config.mirror.worker_number, 8);

        let bad = config.apply_env_overrides(|k| (k == "HUBSYNC_SAAS").then(|| "maybe".to_string()));
        assert!(matches!(bad, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut config = HubConfig::default();
        config.sync.multi_sync_enabled = true;
        assert!(config.validate().is_err());
        config.sync.origin_endpoint = "https://hub.example.com".into();
        config.sync.token = "t".into();
        assert!(config.validate().is_ok());

        config.accounting.enabled = true;
        config.accounting.api_token = "short".into();
        assert!(config.validate().is_err());
        config.accounting.api_token = "x".repeat(32);
        assert!(config.validate().is_ok());

        config.mirror.worker_number = 0;
        assert!(config.validate().is_err());
        config.mirror.worker_number = 1;

        config.features.push_mirror = true;
        assert!(config.validate().is_err());
        config.features.saas = true;
        assert!(config.validate().is_ok());

        config.storage.db_path = PathBuf::new();
        let err: HubSyncError = config.validate().unwrap_err().into();
        assert_eq!(err.kind(), crate::error::ErrorKind::FatalConfig);
    }
}
