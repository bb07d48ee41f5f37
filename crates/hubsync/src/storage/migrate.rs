//! 数据库迁移与初始化，由 refinery 管理
//!
//! - Migration 版本 = migrations/ 下的文件，编译期嵌入、启动时自动执行。
//! - 统一入口 `init_db`：pragmas → migrate → 版本校验。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;

use crate::error::{HubSyncError, Result};
use crate::version::HUB_DB_VERSION;

/// refinery 的 migration 历史表名
const REFINERY_TABLE: &str = "refinery_schema_history";

/// 多进程共享同一个 DB 文件：WAL + 外键
const HUB_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;
PRAGMA temp_store=MEMORY;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(HUB_PRAGMAS.trim())
        .map_err(|e| HubSyncError::Database(format!("设置 PRAGMA 失败: {}", e)))?;
    Ok(())
}

/// 执行内置 migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    embedded::migrations::runner()
        .run(conn)
        .map_err(|e| HubSyncError::Migration(format!("执行 migration 失败: {}", e)))?;
    Ok(())
}

/// 读取当前数据库的 migration 版本；无表或空表返回 None
fn get_db_migration_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [REFINERY_TABLE],
            |row| row.get(0),
        )
        .map_err(|e| HubSyncError::Database(format!("查询 {} 失败: {}", REFINERY_TABLE, e)))?;

    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| HubSyncError::Database(format!("读取 migration 版本失败: {}", e)))?;

    Ok(version.filter(|&v| v > 0))
}

/// DB 版本高于当前程序支持的版本时拒绝打开
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = get_db_migration_version(conn)? else {
        return Ok(());
    };
    if v > HUB_DB_VERSION {
        return Err(HubSyncError::Migration(format!(
            "数据库版本 {} 高于当前程序支持的最高版本 {}，请升级 hubsync 后再打开",
            v, HUB_DB_VERSION
        )));
    }
    Ok(())
}

pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    run_migrations(conn)?;
    check_db_version(conn)?;
    Ok(())
}
