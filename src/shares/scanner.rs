//! 共享目录扫描模块
//!
//! 负责:
//! - 递归枚举共享根目录下的全部子目录
//! - 应用用户过滤正则和排除共享
//! - 按目录非递归列出文件

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ShareConfig;

/// 编译后的扫描过滤器
///
/// 命中任一正则的路径不会被索引
#[derive(Debug, Clone, Default)]
pub struct ScanFilters {
    regexes: Vec<Regex>,
}

impl ScanFilters {
    /// 编译过滤正则列表
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let mut regexes = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex =
                Regex::new(pattern).with_context(|| format!("过滤正则无效: {}", pattern))?;
            regexes.push(regex);
        }
        Ok(Self { regexes })
    }

    /// 判断路径是否被过滤
    pub fn matches(&self, path: &Path) -> bool {
        if self.regexes.is_empty() {
            return false;
        }
        let text = path.to_string_lossy();
        self.regexes.iter().any(|r| r.is_match(&text))
    }
}

/// 扫描到的文件
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件绝对路径
    pub local_path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
    /// 磁盘修改时间
    pub touched_at: Option<DateTime<Utc>>,
}

/// 目录枚举结果
#[derive(Debug, Default)]
pub struct EnumeratedDirectories {
    /// 待扫描的目录（去重、有序）
    pub directories: Vec<PathBuf>,
    /// 被排除共享或过滤正则命中的目录数
    pub excluded: usize,
}

/// 共享目录扫描器
pub struct ShareScanner {
    shares: Vec<ShareConfig>,
    filters: ScanFilters,
}

impl ShareScanner {
    /// 创建扫描器
    pub fn new(shares: Vec<ShareConfig>, filters: ScanFilters) -> Self {
        Self { shares, filters }
    }

    /// 枚举全部非排除共享下的目录
    ///
    /// - 跳过隐藏目录（以 . 开头）和不可读目录
    /// - 命中过滤正则的目录整体跳过
    /// - 位于任一排除共享之下的目录被剔除并计数
    pub fn enumerate_directories(&self) -> EnumeratedDirectories {
        let mut collected: BTreeSet<PathBuf> = BTreeSet::new();
        let mut excluded = 0usize;

        for share in self.shares.iter().filter(|s| !s.excluded) {
            if !share.local_path.is_dir() {
                warn!("共享目录不存在或不是目录，跳过: {:?}", share.local_path);
                continue;
            }
            self.walk_directory(&share.local_path, &mut collected, &mut excluded);
        }

        // 剔除位于排除共享之下的目录
        let excluded_roots: Vec<&PathBuf> = self
            .shares
            .iter()
            .filter(|s| s.excluded)
            .map(|s| &s.local_path)
            .collect();

        let directories: Vec<PathBuf> = collected
            .into_iter()
            .filter(|dir| {
                let hit = excluded_roots.iter().any(|root| dir.starts_with(root));
                if hit {
                    excluded += 1;
                }
                !hit
            })
            .collect();

        EnumeratedDirectories {
            directories,
            excluded,
        }
    }

    /// 递归收集子目录
    fn walk_directory(&self, dir: &Path, collected: &mut BTreeSet<PathBuf>, excluded: &mut usize) {
        if self.filters.matches(dir) {
            debug!("目录命中过滤正则，跳过: {:?}", dir);
            *excluded += 1;
            return;
        }

        collected.insert(dir.to_path_buf());

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取目录失败，跳过: {:?}, 错误: {}", dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if is_hidden(&path) {
                debug!("跳过隐藏目录: {:?}", path);
                continue;
            }
            self.walk_directory(&path, collected, excluded);
        }
    }

    /// 非递归列出单个目录下的文件
    ///
    /// 跳过隐藏文件和命中过滤正则的文件
    pub fn list_files(&self, dir: &Path) -> Vec<ScannedFile> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取目录文件失败: {:?}, 错误: {}", dir, e);
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();

            if is_hidden(&path) {
                continue;
            }
            if self.filters.matches(&path) {
                debug!("文件命中过滤正则，跳过: {:?}", path);
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("读取文件元数据失败: {:?}, 错误: {}", path, e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let touched_at = metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t));

            files.push(ScannedFile {
                local_path: path,
                size: metadata.len(),
                touched_at,
            });
        }

        files.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        files
    }

    /// 将本地路径转换为掩码路径
    ///
    /// 取第一个包含该路径的非排除共享做前缀替换
    pub fn mask(&self, local: &Path) -> Option<String> {
        self.shares
            .iter()
            .filter(|s| !s.excluded)
            .find(|s| s.contains(local))
            .and_then(|s| s.mask(local))
    }

    /// 扫描器持有的共享列表
    pub fn shares(&self) -> &[ShareConfig] {
        &self.shares
    }
}

/// 判断路径是否为隐藏文件/目录（以 . 开头）
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
