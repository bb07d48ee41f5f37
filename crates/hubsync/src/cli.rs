//! 命令行入口
//!
//! 只有配置、数据库、总线等启动阶段的错误会让进程以非零码退出；
//! 批处理中单项失败只记日志，命令打印报告后正常返回。

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::Result;
use crate::mirror::reconcile::MirrorReconciler;
use crate::services::HubServices;
use crate::version::LONG_VERSION;

#[derive(Debug, Parser)]
#[command(name = "hubsync", version = LONG_VERSION, about = "模型/数据集仓库的多实例同步与镜像")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// TOML 配置文件
    #[arg(long, global = true, env = "HUBSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// 日志过滤表达式，如 info 或 hubsync=debug
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// 镜像任务
    #[command(subcommand)]
    Mirror(MirrorCommand),
    /// 多实例拉取同步
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Debug, Subcommand)]
pub enum MirrorCommand {
    /// 常驻：仓库同步 worker pool 与周期对账
    RepoSync,
    /// 常驻：LFS 同步 worker pool
    LfsSync,
    /// 执行一轮镜像进度对账后退出
    CheckMirrorProgress {
        /// 为最近任务失败的镜像重建任务
        #[arg(long)]
        resync: bool,
    },
    /// 从 CSV 批量创建镜像
    CreateMirrorFromFile {
        #[arg(long)]
        file: PathBuf,
        /// 同步 LFS 对象
        #[arg(long)]
        lfs: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum SyncCommand {
    /// 从源站拉取新版本并写入本地
    SyncAsClient,
    /// 压缩账本并清理不在白名单或本地已失效的版本
    ClearSyncVersion,
}

impl Cli {
    pub fn load_config(&self) -> Result<HubConfig> {
        Ok(HubConfig::load(self.global.config.as_deref())?)
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    let services = HubServices::initialize(config).await?;
    let result = dispatch(&services, cli.command).await;
    services.shutdown().await?;
    result
}

async fn dispatch(services: &HubServices, command: Command) -> Result<()> {
    match command {
        Command::Mirror(MirrorCommand::RepoSync) => run_repo_sync(services).await,
        Command::Mirror(MirrorCommand::LfsSync) => {
            let ctx = services.worker_context(services.git_server()?);
            services.lfs_pool(ctx)?.run_until_shutdown().await
        }
        Command::Mirror(MirrorCommand::CheckMirrorProgress { resync }) => {
            let ctx = services.worker_context(services.git_server()?);
            match services.reconciler(ctx).check_mirror_progress(resync).await? {
                Some(report) => println!(
                    "scanned={} recovered={} refreshed={} resynced={}",
                    report.scanned, report.recovered, report.refreshed, report.resynced
                ),
                None => println!("其他实例正在对账，已跳过"),
            }
            Ok(())
        }
        Command::Mirror(MirrorCommand::CreateMirrorFromFile { file, lfs }) => {
            let report = services.importer().import_csv(&file, lfs).await?;
            println!("total={} created={} failed={}", report.total, report.created, report.failed);
            Ok(())
        }
        Command::Sync(SyncCommand::SyncAsClient) => {
            let report = services.sync_engine().await?.sync_as_client().await?;
            println!(
                "cursor={} fetched={} materialized={} skipped={} rejected={}",
                report.cursor, report.fetched, report.materialized, report.skipped, report.rejected
            );
            Ok(())
        }
        Command::Sync(SyncCommand::ClearSyncVersion) => {
            let report = services.cleaner()?.run().await?;
            println!(
                "compacted={} removed={} kept={} failed_pages={} failed_types={}",
                report.compacted, report.removed, report.kept, report.failed_pages, report.failed_types
            );
            Ok(())
        }
    }
}

/// 仓库同步 pool 加对账定时器，ctrl-c 后依次停止
async fn run_repo_sync(services: &HubServices) -> Result<()> {
    let ctx = services.worker_context(services.git_server()?);
    let pool = services.repo_pool(ctx.clone());
    let reconciler = services.reconciler(ctx);
    let period = Duration::from_secs(services.config().mirror.reconcile_interval_secs.max(1));

    let cancel = CancellationToken::new();
    let ticker = tokio::spawn(reconcile_loop(reconciler, period, cancel.clone()));

    let result = pool.run_until_shutdown().await;
    cancel.cancel();
    if let Err(e) = ticker.await {
        warn!("对账定时器异常退出: {}", e);
    }
    result
}

async fn reconcile_loop(reconciler: MirrorReconciler, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("对账定时器启动，间隔 {:?}", period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match reconciler.check_mirror_progress(false).await {
            Ok(Some(report)) => debug!(
                recovered = report.recovered,
                refreshed = report.refreshed,
                "镜像进度对账"
            ),
            Ok(None) => {}
            Err(e) => warn!("镜像进度对账失败: {}", e),
        }
        match reconciler.create_push_mirror_for_finished_tasks().await {
            Ok(Some(report)) if report.created + report.failed > 0 => {
                info!(created = report.created, failed = report.failed, "推送镜像扫描")
            }
            Ok(_) => {}
            Err(e) => warn!("推送镜像扫描失败: {}", e),
        }
    }
    debug!("对账定时器退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mirror_commands() {
        let cli = Cli::try_parse_from(["hubsync", "mirror", "check-mirror-progress", "--resync"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Mirror(MirrorCommand::CheckMirrorProgress { resync: true })
        ));

        let cli = Cli::try_parse_from([
            "hubsync",
            "--config",
            "/etc/hubsync.toml",
            "mirror",
            "create-mirror-from-file",
            "--file",
            "m.csv",
            "--lfs",
        ])
        .unwrap();
        assert_eq!(cli.global.config, Some(PathBuf::from("/etc/hubsync.toml")));
        match cli.command {
            Command::Mirror(MirrorCommand::CreateMirrorFromFile { file, lfs }) => {
                assert_eq!(file, PathBuf::from("m.csv"));
                assert!(lfs);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sync_commands_with_trailing_globals() {
        let cli = Cli::try_parse_from(["hubsync", "sync", "clear-sync-version", "--log-level", "debug"]).unwrap();
        assert!(matches!(cli.command, Command::Sync(SyncCommand::ClearSyncVersion)));
        assert_eq!(cli.global.log_level, "debug");
        assert!(Cli::try_parse_from(["hubsync", "sync", "push"]).is_err());
    }
}
