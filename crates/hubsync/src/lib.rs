//! hubsync - 模型/数据集仓库的多实例同步与镜像引擎
//!
//! - 多实例拉取同步：源站维护版本账本，下游按游标增量拉取（`sync`）
//! - 镜像：从第三方 git 托管拉取仓库与 LFS 对象，两阶段任务状态机（`mirror`）
//! - 分布式锁、消息总线、配额：多实例部署下的协调设施（`lock` / `bus` / `quota`）
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use hubsync::{HubConfig, HubServices};
//!
//! #[tokio::main]
//! async fn main() -> hubsync::Result<()> {
//!     let config = HubConfig::load(None)?;
//!     let services = HubServices::initialize(config).await?;
//!
//!     let report = services.importer().import_csv("mirrors.csv", true).await?;
//!     println!("created {}", report.created);
//!
//!     services.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod http_client;
pub mod lock;
pub mod mirror;
pub mod quota;
pub mod services;
pub mod storage;
pub mod sync;
pub mod throttle;
pub mod utils;
pub mod version;

pub use config::{FeatureFlags, HubConfig};
pub use error::{ErrorKind, HubSyncError, Result};
pub use services::HubServices;
