//! 用户服务接入层
//!
//! 用户到用户组的映射与关注列表；
//! 完整实现由服务器会话层提供，这里附带一个配置驱动的默认实现

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::info;

/// 用户服务
#[async_trait]
pub trait UserService: Send + Sync {
    /// 查询用户所属用户组，未映射返回 None
    async fn get_group(&self, username: &str) -> Option<String>;

    /// 用户是否在关注列表中
    async fn is_watched(&self, username: &str) -> bool;

    /// 关注用户
    async fn watch(&self, username: &str) -> anyhow::Result<()>;
}

/// 配置驱动的用户服务
///
/// 用户组映射来自配置文件的 users 表
pub struct ConfigUserService {
    /// 用户名 -> 用户组
    groups: RwLock<HashMap<String, String>>,
    /// 关注列表
    watched: RwLock<HashSet<String>>,
}

impl ConfigUserService {
    /// 创建用户服务
    pub fn new(groups: HashMap<String, String>) -> Self {
        Self {
            groups: RwLock::new(groups),
            watched: RwLock::new(HashSet::new()),
        }
    }

    /// 替换用户组映射（配置变更时调用）
    pub fn set_groups(&self, groups: HashMap<String, String>) {
        let mut guard = self.groups.write().unwrap();
        *guard = groups;
        info!("用户组映射已更新: {} 个用户", guard.len());
    }
}

#[async_trait]
impl UserService for ConfigUserService {
    async fn get_group(&self, username: &str) -> Option<String> {
        self.groups.read().unwrap().get(username).cloned()
    }

    async fn is_watched(&self, username: &str) -> bool {
        self.watched.read().unwrap().contains(username)
    }

    async fn watch(&self, username: &str) -> anyhow::Result<()> {
        let inserted = self.watched.write().unwrap().insert(username.to_string());
        if inserted {
            info!("已关注用户: {}", username);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_mapping() {
        let mut map = HashMap::new();
        map.insert("alice".to_string(), "privileged".to_string());
        let service = ConfigUserService::new(map);

        assert_eq!(
            service.get_group("alice").await,
            Some("privileged".to_string())
        );
        assert_eq!(service.get_group("bob").await, None);

        service.set_groups(HashMap::new());
        assert_eq!(service.get_group("alice").await, None);
    }

    #[tokio::test]
    async fn test_watch_list() {
        let service = ConfigUserService::new(HashMap::new());
        assert!(!service.is_watched("alice").await);

        service.watch("alice").await.unwrap();
        assert!(service.is_watched("alice").await);
    }
}
