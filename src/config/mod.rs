// 配置管理模块

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 共享目录配置
    #[serde(default)]
    pub shares: SharesConfig,
    /// 上传配置
    #[serde(default)]
    pub uploads: UploadOptions,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 用户名 -> 用户组 映射
    #[serde(default)]
    pub users: HashMap<String, String>,
}

/// 共享目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharesConfig {
    /// 共享根目录列表
    #[serde(default)]
    pub shares: Vec<ShareConfig>,
    /// 扫描过滤正则（匹配的路径不会被索引）
    #[serde(default)]
    pub filters: Vec<String>,
    /// 扫描工作线程数
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
}

fn default_scan_workers() -> usize {
    4
}

impl Default for SharesConfig {
    fn default() -> Self {
        Self {
            shares: Vec::new(),
            filters: Vec::new(),
            scan_workers: default_scan_workers(),
        }
    }
}

/// 单个共享根目录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// 本地路径
    pub local_path: PathBuf,
    /// 对外暴露的远程路径前缀（掩码前缀）
    pub remote_path: String,
    /// 别名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// 是否为排除目录（命中该共享的路径一律不索引）
    #[serde(default)]
    pub excluded: bool,
    /// 所属代理节点，None 表示本机文件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl ShareConfig {
    /// 将本地路径转换为掩码路径
    ///
    /// 本地前缀被替换为远程前缀，分隔符统一为 '/'
    pub fn mask(&self, local: &Path) -> Option<String> {
        let rest = local.strip_prefix(&self.local_path).ok()?;
        let rest = rest.to_string_lossy().replace('\\', "/");
        if rest.is_empty() {
            Some(self.remote_path.clone())
        } else {
            Some(format!("{}/{}", self.remote_path.trim_end_matches('/'), rest))
        }
    }

    /// 判断原始路径是否属于该共享
    pub fn contains(&self, original: &Path) -> bool {
        original.starts_with(&self.local_path)
    }
}

/// 队列策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// 先进先出（按入队时间）
    FirstInFirstOut,
    /// 轮转（按就绪时间）
    RoundRobin,
}

/// 用户组配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// 优先级（数值越小优先级越高）
    pub priority: u32,
    /// 组内上传槽位数
    pub slots: usize,
    /// 队列策略
    pub strategy: QueueStrategy,
    /// 组限速 (KB/s)
    pub speed_limit_kbps: u64,
}

/// 用户组集合配置
///
/// Privileged 组不在配置中：它始终存在，优先级 0、槽位等于全局上限、轮转策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// 默认组（未映射用户归属于此）
    #[serde(default = "default_group_default")]
    pub default: GroupConfig,
    /// 吸血用户组
    #[serde(default = "default_group_leechers")]
    pub leechers: GroupConfig,
    /// 自定义用户组
    #[serde(default)]
    pub user_defined: HashMap<String, GroupConfig>,
}

fn default_group_default() -> GroupConfig {
    GroupConfig {
        priority: 500,
        slots: 10,
        strategy: QueueStrategy::FirstInFirstOut,
        speed_limit_kbps: 1024,
    }
}

fn default_group_leechers() -> GroupConfig {
    GroupConfig {
        priority: 999,
        slots: 1,
        strategy: QueueStrategy::FirstInFirstOut,
        speed_limit_kbps: 256,
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            default: default_group_default(),
            leechers: default_group_leechers(),
            user_defined: HashMap::new(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    /// 全局最大上传槽位数（所有用户组共享）
    pub global_slots: usize,
    /// 全局限速 (KB/s)，Privileged 组使用该值
    pub speed_limit_kbps: u64,
    /// 用户组配置
    #[serde(default)]
    pub groups: GroupsConfig,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            global_slots: 10,
            speed_limit_kbps: 1024, // 约 1 MB/s
            groups: GroupsConfig::default(),
        }
    }
}

impl UploadOptions {
    /// 计算用户组配置指纹（用于变更检测）
    pub fn groups_fingerprint(&self) -> String {
        let json = serde_json::to_string(&self.groups).unwrap_or_default();
        format!("{:x}:{}", md5::compute(json.as_bytes()), self.speed_limit_kbps)
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 传输台账数据库路径
    pub ledger_path: PathBuf,
    /// 共享索引数据库路径
    pub cache_path: PathBuf,
    /// 共享索引备份数据库路径
    pub cache_backup_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("data/transfers.db"),
            cache_path: PathBuf::from("data/shares.db"),
            cache_backup_path: PathBuf::from("data/shares.backup.db"),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件
    pub enabled: bool,
    /// 日志目录
    pub log_dir: PathBuf,
    /// 日志保留天数
    pub retention_days: u32,
    /// 日志级别
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: PathBuf::from("logs"),
            retention_days: 7,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;
        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path.as_ref(), content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 校验配置
    ///
    /// - 共享本地路径必须是绝对路径
    /// - 非排除共享的远程路径必须唯一
    /// - 过滤正则必须可编译
    pub fn validate(&self) -> Result<()> {
        let mut remote_paths = HashSet::new();
        for share in &self.shares.shares {
            if !share.local_path.is_absolute() {
                anyhow::bail!("共享目录必须是绝对路径，当前值: {:?}", share.local_path);
            }
            if !share.excluded && !remote_paths.insert(share.remote_path.as_str()) {
                anyhow::bail!("远程路径重复: {}", share.remote_path);
            }
        }

        for filter in &self.shares.filters {
            Regex::new(filter).with_context(|| format!("过滤正则无效: {}", filter))?;
        }

        if self.uploads.global_slots == 0 {
            anyhow::bail!("全局上传槽位数必须大于 0");
        }

        Ok(())
    }
}
