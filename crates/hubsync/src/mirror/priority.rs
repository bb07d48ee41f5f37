use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HubSyncError;

/// 镜像优先级
///
/// 数值越大越先出队：
/// - High: 用户手动触发、热门仓库
/// - Medium: 对账重建的任务
/// - Low: 批量导入，默认值
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MirrorPriority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl MirrorPriority {
    pub fn value(&self) -> i64 {
        *self as i64
    }

    /// 未知数值按 Low 处理
    pub fn from_value(value: i64) -> Self {
        match value {
            v if v >= 3 => MirrorPriority::High,
            2 => MirrorPriority::Medium,
            _ => MirrorPriority::Low,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            MirrorPriority::High => "高",
            MirrorPriority::Medium => "中",
            MirrorPriority::Low => "低",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MirrorPriority::High => "high",
            MirrorPriority::Medium => "medium",
            MirrorPriority::Low => "low",
        }
    }
}

impl Default for MirrorPriority {
    fn default() -> Self {
        MirrorPriority::Low
    }
}

impl fmt::Display for MirrorPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.display_name(), self.value())
    }
}

impl FromStr for MirrorPriority {
    type Err = HubSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "low" | "1" => Ok(MirrorPriority::Low),
            "medium" | "2" => Ok(MirrorPriority::Medium),
            "high" | "3" => Ok(MirrorPriority::High),
            other => Err(HubSyncError::InvalidArgument(format!("无效的优先级: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_value_sorts_first() {
        let mut ps = vec![MirrorPriority::Low, MirrorPriority::High, MirrorPriority::Medium];
        ps.sort_by(|a, b| b.cmp(a));
        assert_eq!(ps, vec![MirrorPriority::High, MirrorPriority::Medium, MirrorPriority::Low]);
        assert_eq!(MirrorPriority::High.value(), 3);
    }

    #[test]
    fn test_parse() {
        assert_eq!("HIGH".parse::<MirrorPriority>().unwrap(), MirrorPriority::High);
        assert_eq!("".parse::<MirrorPriority>().unwrap(), MirrorPriority::Low);
        assert_eq!(MirrorPriority::from_value(2), MirrorPriority::Medium);
        assert_eq!(MirrorPriority::from_value(99), MirrorPriority::High);
        assert!("urgent".parse::<MirrorPriority>().is_err());
    }
}
