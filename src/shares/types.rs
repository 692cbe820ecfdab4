// 共享索引模块数据类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// 重新导出配置模块中的共享配置
pub use crate::config::{ShareConfig, SharesConfig};

/// 本机宿主哨兵值
///
/// 文件解析结果的宿主为该值时，文件在本机磁盘上；否则为代理节点名
pub const LOCAL_HOST: &str = "local";

/// 共享索引错误
#[derive(Debug)]
pub enum ShareError {
    /// 扫描已在进行中
    ScanInProgress,
    /// 存储层错误
    Storage(String),
}

impl std::fmt::Display for ShareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScanInProgress => write!(f, "共享扫描已在进行中"),
            Self::Storage(msg) => write!(f, "共享索引存储错误: {}", msg),
        }
    }
}

impl std::error::Error for ShareError {}

/// 文件属性（码率、时长等，随 peer 协议透传）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttribute {
    /// 属性码
    pub code: u32,
    /// 属性值
    pub value: u32,
}

/// 索引中的文件记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// 掩码文件名（主键，对外可见）
    pub masked_filename: String,
    /// 原始文件名（本地或代理侧的物理路径）
    pub original_filename: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 磁盘修改时间
    pub touched_at: Option<DateTime<Utc>>,
    /// 文件类型码
    pub code: u32,
    /// 扩展名（小写）
    pub extension: Option<String>,
    /// 属性列表
    #[serde(default)]
    pub attributes: Vec<FileAttribute>,
    /// 扫描纪元时间戳（毫秒），早于当前扫描的行是墓碑
    pub timestamp: i64,
}

/// 索引中的目录记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// 掩码目录名（主键）
    pub name: String,
    /// 扫描纪元时间戳（毫秒）
    pub timestamp: i64,
}

/// 目录清单（browse/list 的返回单元）
///
/// 无文件的目录以空清单出现，peer 协议需要完整的目录树形状
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryListing {
    /// 掩码目录名
    pub name: String,
    /// 目录下的文件（非递归）
    pub files: Vec<FileRecord>,
}

/// 掩码名解析结果
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// 原始文件名
    pub original_filename: String,
    /// 索引中记录的大小
    pub size: u64,
}

/// 扫描结果摘要
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// 索引的文件数
    pub files: usize,
    /// 索引的目录数
    pub directories: usize,
    /// 被排除/过滤的目录数
    pub excluded_directories: usize,
    /// 扫描是否被取消
    pub cancelled: bool,
}

/// 共享索引状态（通过 watch 通道广播）
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShareCacheState {
    /// 是否正在扫描
    pub filling: bool,
    /// 索引是否已填充完成
    pub filled: bool,
    /// 最近一次扫描是否异常终止
    pub faulted: bool,
    /// 最近一次扫描是否被取消
    pub cancelled: bool,
    /// 扫描进度 [0, 1]
    pub fill_progress: f64,
    /// 文件数
    pub files: usize,
    /// 目录数
    pub directories: usize,
    /// 被排除的目录数
    pub excluded_directories: usize,
}

/// 检索查询
///
/// 以空格分词，`-` 前缀的词为排除项；
/// 路径分隔符、引号和冒号在分词前被替换为空格
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// 必须命中的词
    pub terms: Vec<String>,
    /// 必须不命中的词
    pub exclusions: Vec<String>,
}

impl SearchQuery {
    /// 解析查询文本
    pub fn parse(text: &str) -> Self {
        let sanitized: String = text
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '"' | '\'' => ' ',
                other => other,
            })
            .collect();

        let mut terms = Vec::new();
        let mut exclusions = Vec::new();

        for token in sanitized.split_whitespace() {
            if let Some(stripped) = token.strip_prefix('-') {
                if !stripped.is_empty() {
                    exclusions.push(stripped.to_lowercase());
                }
            } else {
                terms.push(token.to_lowercase());
            }
        }

        Self { terms, exclusions }
    }

    /// 构造 FTS MATCH 表达式
    ///
    /// 形如 `("t1" AND "t2") NOT ("x1" OR "x2")`，无正向词时返回 None
    pub fn to_match_expression(&self) -> Option<String> {
        if self.terms.is_empty() {
            return None;
        }

        let positive = self
            .terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" AND ");

        if self.exclusions.is_empty() {
            Some(format!("({})", positive))
        } else {
            let negative = self
                .exclusions
                .iter()
                .map(|t| format!("\"{}\"", t))
                .collect::<Vec<_>>()
                .join(" OR ");
            Some(format!("({}) NOT ({})", positive, negative))
        }
    }
}

/// 在共享列表中查找包含原始路径的共享，返回宿主名
///
/// 本机共享返回 [`LOCAL_HOST`]
pub fn host_for(shares: &[ShareConfig], original: &Path) -> Option<String> {
    shares
        .iter()
        .filter(|s| !s.excluded)
        .find(|s| s.contains(original))
        .map(|s| s.agent.clone().unwrap_or_else(|| LOCAL_HOST.to_string()))
}

/// 取掩码文件名的父目录部分
pub fn parent_directory(masked_filename: &str) -> &str {
    match masked_filename.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_search_query_parse() {
        let q = SearchQuery::parse("pink floyd -live");
        assert_eq!(q.terms, vec!["pink", "floyd"]);
        assert_eq!(q.exclusions, vec!["live"]);
    }

    #[test]
    fn test_search_query_sanitizes_separators() {
        let q = SearchQuery::parse("rock/metal \"best\" disc:1");
        assert_eq!(q.terms, vec!["rock", "metal", "best", "disc", "1"]);
        assert!(q.exclusions.is_empty());
    }

    #[test]
    fn test_match_expression() {
        let q = SearchQuery::parse("pink floyd -live -bootleg");
        assert_eq!(
            q.to_match_expression().unwrap(),
            "(\"pink\" AND \"floyd\") NOT (\"live\" OR \"bootleg\")"
        );

        let q = SearchQuery::parse("floyd");
        assert_eq!(q.to_match_expression().unwrap(), "(\"floyd\")");

        // 只有排除项时无法构成查询
        let q = SearchQuery::parse("-live");
        assert!(q.to_match_expression().is_none());
    }

    #[test]
    fn test_host_for() {
        let shares = vec![
            ShareConfig {
                local_path: PathBuf::from("/music"),
                remote_path: "@@abc/music".to_string(),
                alias: None,
                excluded: false,
                agent: None,
            },
            ShareConfig {
                local_path: PathBuf::from("/agent-files"),
                remote_path: "@@abc/agent".to_string(),
                alias: None,
                excluded: false,
                agent: Some("node-1".to_string()),
            },
        ];

        assert_eq!(
            host_for(&shares, Path::new("/music/a.mp3")),
            Some(LOCAL_HOST.to_string())
        );
        assert_eq!(
            host_for(&shares, Path::new("/agent-files/b.mp3")),
            Some("node-1".to_string())
        );
        assert_eq!(host_for(&shares, Path::new("/other/c.mp3")), None);
    }

    #[test]
    fn test_parent_directory() {
        assert_eq!(parent_directory("@@abc/music/rock/a.mp3"), "@@abc/music/rock");
        assert_eq!(parent_directory("plain.mp3"), "");
    }
}
