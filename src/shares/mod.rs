//! 共享文件索引模块
//!
//! 负责本地/代理共享目录的扫描、掩码名解析与全文检索，
//! 上传准入路径上的每一次文件解析都经过这里

pub mod cache;
pub mod scanner;
pub mod types;

pub use cache::ShareCache;
pub use scanner::{ScanFilters, ShareScanner};
pub use types::{
    DirectoryListing, DirectoryRecord, FileAttribute, FileRecord, ResolvedFile, ScanSummary,
    SearchQuery, ShareCacheState, ShareError, LOCAL_HOST,
};
