//! 版本与构建元信息
//!
//! - **crate 版本** → Cargo.toml
//! - **Migration 版本** → migrations 文件（文件即版本，由 refinery 自动管理）
//! - **构建元信息** → vergen（build.rs）

/// hubsync semver，来自 Cargo.toml
pub const HUBSYNC_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 当前程序支持的最高数据库 migration 版本。
/// 由 build.rs 扫描 migrations/ 下 V{version}__*.sql 取最大值生成；
/// 启动时若 DB 版本高于此值则拒绝打开。
pub const HUB_DB_VERSION: i64 = parse_db_version(env!("HUB_DB_VERSION"));

/// 编译期解析版本号字符串为 i64（build.rs 只会输出纯数字）
const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// `hubsync --version` 的完整输出
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (git ",
    env!("VERGEN_GIT_SHA"),
    ", built ",
    env!("VERGEN_BUILD_TIMESTAMP"),
    ")"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_db_version() {
        assert_eq!(parse_db_version("0"), 0);
        assert_eq!(parse_db_version("12"), 12);
        assert!(HUB_DB_VERSION >= 1);
    }

    #[test]
    fn test_long_version_carries_build_metadata() {
        assert!(LONG_VERSION.starts_with(HUBSYNC_VERSION));
        assert!(LONG_VERSION.contains(GIT_SHA));
        assert!(LONG_VERSION.contains(BUILD_TIME));
    }
}
