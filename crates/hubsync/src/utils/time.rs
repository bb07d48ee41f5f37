//! 时间处理工具模块
//!
//! - **存储层**: 所有时间字段统一存为 UTC RFC3339 字符串（毫秒精度，`Z` 结尾），可按字典序比较
//! - **业务层**: 统一通过 [`now_string`] 生成时间

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// 当前 UTC 时间的存储格式字符串
pub fn now_string() -> String {
    format_time(Utc::now())
}

/// 将时间格式化为存储格式
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 当前时间加上指定秒数后的存储格式字符串
pub fn after_secs(secs: u64) -> String {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX / 1000);
    format_time(Utc::now() + Duration::seconds(secs))
}

/// 当前时间减去指定秒数后的存储格式字符串
pub fn before_secs(secs: u64) -> String {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX / 1000);
    format_time(Utc::now() - Duration::seconds(secs))
}

/// 解析存储格式时间，失败返回 None
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_is_sortable() {
        let a = now_string();
        let b = after_secs(5);
        assert!(a < b);
        assert!(before_secs(5) < a);
        assert!(a.ends_with('Z'));
        assert!(parse_time(&a).is_some());
        assert!(parse_time("not a time").is_none());
    }
}
