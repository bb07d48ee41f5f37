//! 清理账本时判断哪些仓库仍然有效

use std::collections::HashSet;

use regex::Regex;

use crate::error::{HubSyncError, Result};
use crate::storage::entities::Repository;

const SEGMENT_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$";

/// 待判断的仓库：账本里的路径 + 本地解析结果
#[derive(Debug, Clone)]
pub struct LocalRepo {
    /// 账本中的源站路径
    pub path: String,
    pub local: Option<Repository>,
}

#[derive(Debug, Clone)]
pub struct RepoFilter {
    segment: Regex,
    namespaces: HashSet<String>,
}

impl RepoFilter {
    /// namespaces 为空时不限制
    pub fn new(namespaces: &[String]) -> Result<Self> {
        let segment = Regex::new(SEGMENT_PATTERN)
            .map_err(|e| HubSyncError::Config(format!("仓库路径规则无效: {}", e)))?;
        Ok(Self {
            segment,
            namespaces: namespaces.iter().cloned().collect(),
        })
    }

    pub fn is_valid_path(&self, path: &str) -> bool {
        if path.contains("..") {
            return false;
        }
        let Some((ns, name)) = path.split_once('/') else {
            return false;
        };
        if !self.segment.is_match(ns) || !self.segment.is_match(name) {
            return false;
        }
        if name.ends_with(".git") {
            return false;
        }
        self.namespaces.is_empty() || self.namespaces.contains(ns)
    }

    /// 返回仍然有效的路径
    pub fn batch_match(&self, repos: &[LocalRepo]) -> Vec<String> {
        repos
            .iter()
            .filter(|r| matches!(&r.local, Some(local) if !local.is_deleted()))
            .filter(|r| self.is_valid_path(&r.path))
            .map(|r| r.path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(path: &str, deleted: bool) -> LocalRepo {
        LocalRepo {
            path: path.to_string(),
            local: Some(Repository {
                id: 1,
                repository_type: "model".into(),
                path: path.to_string(),
                name: String::new(),
                nickname: String::new(),
                description: String::new(),
                license: String::new(),
                private: false,
                default_branch: "main".into(),
                source: String::new(),
                sync_status: String::new(),
                readme: String::new(),
                downloads: 0,
                likes: 0,
                deleted_at: deleted.then(|| "2024-01-01T00:00:00Z".to_string()),
                created_at: String::new(),
                updated_at: String::new(),
            }),
        }
    }

    #[test]
    fn test_batch_match_rules() {
        let filter = RepoFilter::new(&[]).unwrap();
        let repos = vec![
            repo("ns/ok", false),
            repo("ns/gone", true),
            LocalRepo { path: "ns/missing".into(), local: None },
            repo("ns/x.git", false),
            repo("ns/../etc", false),
            repo("noslash", false),
            repo("-bad/name", false),
            repo("ns/a.b_c-d", false),
        ];
        assert_eq!(filter.batch_match(&repos), vec!["ns/ok".to_string(), "ns/a.b_c-d".to_string()]);
    }

    #[test]
    fn test_namespace_allowlist() {
        let filter = RepoFilter::new(&["allowed".to_string()]).unwrap();
        let repos = vec![repo("allowed/a", false), repo("other/b", false)];
        assert_eq!(filter.batch_match(&repos), vec!["allowed/a".to_string()]);
        assert!(filter.batch_match(&[]).is_empty());
    }
}
