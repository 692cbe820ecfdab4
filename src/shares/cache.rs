//! 共享文件索引缓存
//!
//! 将掩码名映射到物理文件并提供全文检索
//! - 活动库 + 备份库两个 SQLite 数据库，WAL 模式
//! - 扫描为单写者协议，取消的扫描绝不执行墓碑清理
//! - 状态通过 watch 通道广播

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scanner::{ScanFilters, ShareScanner};
use super::types::{
    parent_directory, DirectoryListing, DirectoryRecord, FileAttribute, FileRecord, ResolvedFile,
    ScanSummary, SearchQuery, ShareCacheState, ShareError,
};
use crate::config::{ShareConfig, SharesConfig, StorageConfig};

/// 扫描目录分发通道容量（写满时阻塞驱动端形成背压）
const SCAN_CHANNEL_CAPACITY: usize = 1000;

/// 共享文件索引缓存
pub struct ShareCache {
    /// 共享根目录列表
    shares: Vec<ShareConfig>,
    /// 编译后的过滤正则
    filters: ScanFilters,
    /// 扫描工作线程数
    scan_workers: usize,
    /// 备份数据库路径
    backup_path: PathBuf,
    /// 活动库连接
    conn: Arc<Mutex<Connection>>,
    /// 状态广播
    state_tx: watch::Sender<ShareCacheState>,
    /// 扫描单写者互斥
    fill_lock: tokio::sync::Mutex<()>,
    /// 当前扫描的取消令牌
    scan_token: Mutex<Option<CancellationToken>>,
    /// 进程级关闭令牌
    master_token: CancellationToken,
}

impl ShareCache {
    /// 创建共享索引缓存
    pub fn new(
        shares_config: &SharesConfig,
        storage: &StorageConfig,
        master_token: CancellationToken,
    ) -> Result<Self> {
        if let Some(parent) = storage.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&storage.cache_path)
            .with_context(|| format!("打开共享索引数据库失败: {:?}", storage.cache_path))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let filters = ScanFilters::compile(&shares_config.filters)?;
        let (state_tx, _) = watch::channel(ShareCacheState::default());

        Ok(Self {
            shares: shares_config.shares.clone(),
            filters,
            scan_workers: shares_config.scan_workers.max(1),
            backup_path: storage.cache_backup_path.clone(),
            conn: Arc::new(Mutex::new(conn)),
            state_tx,
            fill_lock: tokio::sync::Mutex::new(()),
            scan_token: Mutex::new(None),
            master_token,
        })
    }

    // ========================================================================
    // 状态
    // ========================================================================

    /// 订阅状态变更
    pub fn state(&self) -> watch::Receiver<ShareCacheState> {
        self.state_tx.subscribe()
    }

    /// 获取当前状态快照
    pub fn current_state(&self) -> ShareCacheState {
        self.state_tx.borrow().clone()
    }

    /// 函数式状态更新（prev -> next），每次变更都会广播
    fn update_state(&self, f: impl FnOnce(&ShareCacheState) -> ShareCacheState) {
        self.state_tx.send_modify(|state| *state = f(state));
    }

    // ========================================================================
    // 表结构
    // ========================================================================

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS directories (
                name TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                masked_filename TEXT PRIMARY KEY,
                original_filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                touched_at INTEGER,
                code INTEGER NOT NULL,
                extension TEXT,
                attributes_json TEXT,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS filenames USING fts5(masked_filename)",
            [],
        )?;
        Ok(())
    }

    /// 校验表结构是否完整
    fn validate_schema(conn: &Connection) -> Result<bool> {
        let table_count: usize = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE name IN ('directories', 'files', 'filenames')",
            [],
            |row| row.get(0),
        )?;
        if table_count < 3 {
            return Ok(false);
        }

        let file_columns: usize = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('files')",
            [],
            |row| row.get(0),
        )?;
        Ok(file_columns == 8)
    }

    fn drop_schema(conn: &Connection) -> Result<()> {
        conn.execute("DROP TABLE IF EXISTS files", [])?;
        conn.execute("DROP TABLE IF EXISTS directories", [])?;
        conn.execute("DROP TABLE IF EXISTS filenames", [])?;
        Ok(())
    }

    // ========================================================================
    // 启动加载
    // ========================================================================

    /// 启动时尝试加载已有索引
    ///
    /// 活动库有效则直接使用；无效或缺失时从备份库恢复；
    /// 两者都不可用时重建空表，返回 false
    pub fn try_load(&self) -> Result<bool> {
        {
            let conn = self.lock_conn()?;
            if Self::validate_schema(&conn)? {
                drop(conn);
                self.publish_counts()?;
                self.update_state(|s| ShareCacheState {
                    filled: true,
                    ..s.clone()
                });
                info!("共享索引加载完成（活动库有效）");
                return Ok(true);
            }
        }

        if self.backup_path.exists() {
            let backup_conn = Connection::open(&self.backup_path)
                .with_context(|| format!("打开备份数据库失败: {:?}", self.backup_path))?;
            if Self::validate_schema(&backup_conn)? {
                {
                    let mut conn = self.lock_conn()?;
                    Self::drop_schema(&conn)?;
                    let backup = Backup::new(&backup_conn, &mut conn)?;
                    backup.run_to_completion(256, Duration::from_millis(10), None)?;
                }
                self.publish_counts()?;
                self.update_state(|s| ShareCacheState {
                    filled: true,
                    ..s.clone()
                });
                info!("共享索引已从备份库恢复");
                return Ok(true);
            }
            warn!("备份数据库结构无效，忽略");
        }

        let conn = self.lock_conn()?;
        Self::drop_schema(&conn)?;
        Self::init_schema(&conn)?;
        info!("共享索引为空，等待首次扫描");
        Ok(false)
    }

    // ========================================================================
    // 扫描（fill 协议）
    // ========================================================================

    /// 执行一次完整扫描
    ///
    /// 单写者：已有扫描在进行时返回 [`ShareError::ScanInProgress`]。
    /// 被取消的扫描不执行墓碑清理，索引不会因取消而丢数据
    pub async fn fill(&self) -> Result<ScanSummary, ShareError> {
        let _guard = self
            .fill_lock
            .try_lock()
            .map_err(|_| ShareError::ScanInProgress)?;

        let token = self.master_token.child_token();
        *self.scan_token.lock().unwrap() = Some(token.clone());

        self.update_state(|s| ShareCacheState {
            filling: true,
            filled: false,
            faulted: false,
            cancelled: false,
            fill_progress: 0.0,
            ..s.clone()
        });

        info!("🔍 开始扫描共享目录: {} 个共享", self.shares.len());
        let result = self.fill_inner(&token).await;

        *self.scan_token.lock().unwrap() = None;

        match result {
            Ok(summary) => {
                self.update_state(|s| ShareCacheState {
                    filling: false,
                    filled: !summary.cancelled,
                    cancelled: summary.cancelled,
                    fill_progress: if summary.cancelled { s.fill_progress } else { 1.0 },
                    files: summary.files,
                    directories: summary.directories,
                    excluded_directories: summary.excluded_directories,
                    ..s.clone()
                });

                if summary.cancelled {
                    warn!(
                        "共享扫描已取消: 索引保留 {} 个文件 / {} 个目录",
                        summary.files, summary.directories
                    );
                } else {
                    info!(
                        "✅ 共享扫描完成: {} 个文件, {} 个目录, 排除 {} 个目录",
                        summary.files, summary.directories, summary.excluded_directories
                    );
                }
                Ok(summary)
            }
            Err(e) => {
                error!("共享扫描失败: {:#}", e);
                self.update_state(|s| ShareCacheState {
                    filling: false,
                    filled: false,
                    faulted: true,
                    ..s.clone()
                });
                Err(ShareError::Storage(e.to_string()))
            }
        }
    }

    async fn fill_inner(&self, token: &CancellationToken) -> Result<ScanSummary> {
        // 表结构无效时整体重建
        {
            let conn = self.lock_conn()?;
            if !Self::validate_schema(&conn)? {
                warn!("共享索引表结构无效，重建全部表");
                Self::drop_schema(&conn)?;
            }
            Self::init_schema(&conn)?;
        }

        // 扫描纪元：本次写入的每一行都打上该时间戳
        let epoch = Utc::now().timestamp_millis();

        let scanner = Arc::new(ShareScanner::new(self.shares.clone(), self.filters.clone()));
        let enumerated = scanner.enumerate_directories();
        let total = enumerated.directories.len();
        let excluded_directories = enumerated.excluded;
        info!("目录枚举完成: {} 个目录待扫描, {} 个被排除", total, excluded_directories);

        // 有界通道分发目录，工作者读到通道关闭为止
        let (dir_tx, dir_rx) = mpsc::channel::<PathBuf>(SCAN_CHANNEL_CAPACITY);
        let dir_rx = Arc::new(tokio::sync::Mutex::new(dir_rx));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(self.scan_workers);
        for worker_id in 0..self.scan_workers {
            let dir_rx = dir_rx.clone();
            let conn = self.conn.clone();
            let scanner = scanner.clone();
            let token = token.clone();
            let processed = processed.clone();
            let state_tx = self.state_tx.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let dir = { dir_rx.lock().await.recv().await };
                    let Some(dir) = dir else { break };

                    if token.is_cancelled() {
                        continue;
                    }

                    if let Err(e) = Self::process_directory(&conn, &scanner, &dir, epoch) {
                        warn!("[扫描线程{}] 处理目录失败: {:?}, 错误: {}", worker_id, dir, e);
                    }

                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    state_tx.send_modify(|s| {
                        s.fill_progress = done as f64 / total.max(1) as f64;
                    });
                }
            }));
        }

        // 驱动端：写满时阻塞形成背压，取消时立即停止分发
        let mut cancelled = false;
        for dir in enumerated.directories {
            tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                }
                sent = dir_tx.send(dir) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(dir_tx);

        for worker in workers {
            let _ = worker.await;
        }
        cancelled |= token.is_cancelled();

        if !cancelled {
            // 墓碑清理：删除早于本次扫描纪元的所有行
            let swept = self.sweep_tombstones(epoch)?;
            if swept > 0 {
                info!("墓碑清理完成: 删除 {} 行过期记录", swept);
            }

            // 活动库备份
            self.backup_database()?;
            debug!("共享索引已备份到: {:?}", self.backup_path);
        }

        let (files, directories) = self.counts()?;
        Ok(ScanSummary {
            files,
            directories,
            excluded_directories,
            cancelled,
        })
    }

    /// 处理单个目录：写入目录行并补齐该目录下的文件行
    fn process_directory(
        conn: &Arc<Mutex<Connection>>,
        scanner: &ShareScanner,
        dir: &Path,
        epoch: i64,
    ) -> Result<()> {
        let Some(masked_dir) = scanner.mask(dir) else {
            return Ok(());
        };
        let files = scanner.list_files(dir);

        let mut conn = conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO directories (name, timestamp) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET timestamp = excluded.timestamp",
            params![masked_dir, epoch],
        )?;

        for file in files {
            let Some(masked) = scanner.mask(&file.local_path) else {
                continue;
            };
            let extension = file
                .local_path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());
            let attributes_json =
                serde_json::to_string(&Vec::<FileAttribute>::new()).unwrap_or_default();

            tx.execute(
                "INSERT INTO files (
                    masked_filename, original_filename, size, touched_at,
                    code, extension, attributes_json, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(masked_filename) DO UPDATE SET
                    original_filename = excluded.original_filename,
                    size = excluded.size,
                    touched_at = excluded.touched_at,
                    code = excluded.code,
                    extension = excluded.extension,
                    attributes_json = excluded.attributes_json,
                    timestamp = excluded.timestamp",
                params![
                    masked,
                    file.local_path.to_string_lossy().to_string(),
                    file.size as i64,
                    file.touched_at.map(|t| t.timestamp_millis()),
                    1i64,
                    extension,
                    attributes_json,
                    epoch,
                ],
            )?;

            // 全文索引行重建（FTS5 无主键冲突语义）
            tx.execute(
                "DELETE FROM filenames WHERE masked_filename = ?1",
                params![masked],
            )?;
            tx.execute(
                "INSERT INTO filenames (masked_filename) VALUES (?1)",
                params![masked],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// 删除扫描纪元之前的全部行（文件、目录和全文索引）
    fn sweep_tombstones(&self, epoch: i64) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM filenames WHERE masked_filename IN
                (SELECT masked_filename FROM files WHERE timestamp < ?1)",
            params![epoch],
        )?;
        let files = tx.execute("DELETE FROM files WHERE timestamp < ?1", params![epoch])?;
        let dirs = tx.execute("DELETE FROM directories WHERE timestamp < ?1", params![epoch])?;

        tx.commit()?;
        Ok(files + dirs)
    }

    /// 将活动库备份到备份库
    fn backup_database(&self) -> Result<()> {
        if let Some(parent) = self.backup_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.lock_conn()?;
        let mut dst = Connection::open(&self.backup_path)
            .with_context(|| format!("打开备份数据库失败: {:?}", self.backup_path))?;
        let backup = Backup::new(&conn, &mut dst)?;
        backup.run_to_completion(256, Duration::from_millis(10), None)?;
        Ok(())
    }

    /// 取消正在进行的扫描
    ///
    /// 返回是否发出了取消信号
    pub fn try_cancel_fill(&self) -> bool {
        let guard = self.scan_token.lock().unwrap();
        match guard.as_ref() {
            Some(token) => {
                token.cancel();
                info!("已请求取消共享扫描");
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 按掩码名解析物理文件
    ///
    /// 返回 None 表示未共享
    pub fn resolve(&self, masked_filename: &str) -> Result<Option<ResolvedFile>> {
        let conn = self.lock_conn()?;
        let resolved = conn
            .query_row(
                "SELECT original_filename, size FROM files WHERE masked_filename = ?1",
                params![masked_filename],
                |row| {
                    Ok(ResolvedFile {
                        original_filename: row.get(0)?,
                        size: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(resolved)
    }

    /// 全文检索
    ///
    /// 结果按掩码名升序排列；查询无正向词时返回空集
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<FileRecord>> {
        let Some(match_expr) = query.to_match_expression() else {
            return Ok(Vec::new());
        };

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT masked_filename, original_filename, size, touched_at,
                    code, extension, attributes_json, timestamp
             FROM files
             WHERE masked_filename IN
                (SELECT masked_filename FROM filenames WHERE filenames MATCH ?1)
             ORDER BY masked_filename ASC",
        )?;

        let rows = stmt.query_map(params![match_expr], Self::row_to_file_record)?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(record) => records.push(record),
                Err(e) => warn!("读取检索结果行失败: {}", e),
            }
        }
        Ok(records)
    }

    /// 浏览目录树
    ///
    /// 返回全部目录（可按共享前缀过滤），文件归入各自父目录；
    /// 无文件的目录以空清单出现
    pub fn browse(&self, prefix: Option<&str>) -> Result<Vec<DirectoryListing>> {
        let conn = self.lock_conn()?;

        let mut listings: Vec<DirectoryListing> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        {
            let (sql, pattern) = match prefix {
                Some(p) => (
                    "SELECT name FROM directories WHERE name = ?1 OR name LIKE ?1 || '/%' ORDER BY name ASC",
                    Some(p.to_string()),
                ),
                None => ("SELECT name FROM directories ORDER BY name ASC", None),
            };
            let mut stmt = conn.prepare(sql)?;
            let mut push_row = |name: String| {
                index.insert(name.clone(), listings.len());
                listings.push(DirectoryListing {
                    name,
                    files: Vec::new(),
                });
            };
            match pattern {
                Some(p) => {
                    let rows = stmt.query_map(params![p], |row| row.get::<_, String>(0))?;
                    for row in rows.flatten() {
                        push_row(row);
                    }
                }
                None => {
                    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                    for row in rows.flatten() {
                        push_row(row);
                    }
                }
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT masked_filename, original_filename, size, touched_at,
                        code, extension, attributes_json, timestamp
                 FROM files ORDER BY masked_filename ASC",
            )?;
            let rows = stmt.query_map([], Self::row_to_file_record)?;
            for row in rows.flatten() {
                let dir = parent_directory(&row.masked_filename).to_string();
                if let Some(&slot) = index.get(&dir) {
                    listings[slot].files.push(row);
                }
            }
        }

        Ok(listings)
    }

    /// 列出单个目录
    pub fn list_directory(&self, name: &str) -> Result<Option<DirectoryListing>> {
        let conn = self.lock_conn()?;

        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM directories WHERE name = ?1",
                params![name],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Ok(None);
        }

        let mut stmt = conn.prepare(
            "SELECT masked_filename, original_filename, size, touched_at,
                    code, extension, attributes_json, timestamp
             FROM files WHERE masked_filename LIKE ?1 || '/%'
             ORDER BY masked_filename ASC",
        )?;
        let rows = stmt.query_map(params![name], Self::row_to_file_record)?;

        let mut files = Vec::new();
        for row in rows.flatten() {
            // LIKE 会命中更深层级的文件，只保留直接子文件
            if parent_directory(&row.masked_filename) == name {
                files.push(row);
            }
        }

        Ok(Some(DirectoryListing {
            name: name.to_string(),
            files,
        }))
    }

    /// 列出全部目录行（按名称升序）
    pub fn directories(&self) -> Result<Vec<DirectoryRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT name, timestamp FROM directories ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(DirectoryRecord {
                name: row.get(0)?,
                timestamp: row.get(1)?,
            })
        })?;
        Ok(rows.flatten().collect())
    }

    /// 统计文件数（可按共享前缀过滤）
    pub fn count_files(&self, prefix: Option<&str>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: usize = match prefix {
            Some(p) => conn.query_row(
                "SELECT COUNT(*) FROM files WHERE masked_filename LIKE ?1 || '/%'",
                params![p],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// 统计目录数（可按共享前缀过滤）
    pub fn count_directories(&self, prefix: Option<&str>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: usize = match prefix {
            Some(p) => conn.query_row(
                "SELECT COUNT(*) FROM directories WHERE name = ?1 OR name LIKE ?1 || '/%'",
                params![p],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM directories", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// 缓存持有的共享列表
    pub fn shares(&self) -> &[ShareConfig] {
        &self.shares
    }

    // ========================================================================
    // 辅助方法
    // ========================================================================

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    fn counts(&self) -> Result<(usize, usize)> {
        Ok((self.count_files(None)?, self.count_directories(None)?))
    }

    fn publish_counts(&self) -> Result<()> {
        let (files, directories) = self.counts()?;
        self.update_state(|s| ShareCacheState {
            files,
            directories,
            ..s.clone()
        });
        Ok(())
    }

    fn row_to_file_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
        let attributes: Vec<FileAttribute> = row
            .get::<_, Option<String>>(6)?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();

        Ok(FileRecord {
            masked_filename: row.get(0)?,
            original_filename: row.get(1)?,
            size: row.get::<_, i64>(2)? as u64,
            touched_at: row
                .get::<_, Option<i64>>(3)?
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            code: row.get::<_, i64>(4)? as u32,
            extension: row.get(5)?,
            attributes,
            timestamp: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        storage: StorageConfig,
        shares: SharesConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("music");
        fs::create_dir_all(&root).unwrap();

        let storage = StorageConfig {
            ledger_path: dir.path().join("transfers.db"),
            cache_path: dir.path().join("shares.db"),
            cache_backup_path: dir.path().join("shares.backup.db"),
        };
        let shares = SharesConfig {
            shares: vec![ShareConfig {
                local_path: root.clone(),
                remote_path: "@@abc/music".to_string(),
                alias: None,
                excluded: false,
                agent: None,
            }],
            filters: Vec::new(),
            scan_workers: 2,
        };

        Fixture {
            _dir: dir,
            root,
            storage,
            shares,
        }
    }

    fn touch(path: &Path) {
        fs::write(path, b"data").unwrap();
    }

    fn cache(f: &Fixture) -> ShareCache {
        ShareCache::new(&f.shares, &f.storage, CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn test_fill_and_resolve_roundtrip() {
        let f = fixture();
        fs::create_dir_all(f.root.join("rock")).unwrap();
        touch(&f.root.join("rock/song.mp3"));
        touch(&f.root.join("top.flac"));

        let cache = cache(&f);
        let summary = cache.fill().await.unwrap();
        assert!(!summary.cancelled);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 2); // music, rock

        // 解析回原始路径
        let resolved = cache.resolve("@@abc/music/rock/song.mp3").unwrap().unwrap();
        assert_eq!(
            resolved.original_filename,
            f.root.join("rock/song.mp3").to_string_lossy()
        );
        assert_eq!(resolved.size, 4);

        // 未共享的文件
        assert!(cache.resolve("@@abc/music/missing.mp3").unwrap().is_none());

        let state = cache.current_state();
        assert!(state.filled);
        assert!(!state.filling);
        assert_eq!(state.fill_progress, 1.0);
    }

    #[tokio::test]
    async fn test_search_with_exclusions() {
        let f = fixture();
        touch(&f.root.join("floyd_live.mp3"));
        touch(&f.root.join("floyd_studio.mp3"));

        let cache = cache(&f);
        cache.fill().await.unwrap();

        let hits = cache.search(&SearchQuery::parse("floyd")).unwrap();
        assert_eq!(hits.len(), 2);
        // 升序排列
        assert!(hits[0].masked_filename < hits[1].masked_filename);

        let hits = cache.search(&SearchQuery::parse("floyd -live")).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].masked_filename.contains("studio"));

        // 无正向词
        assert!(cache.search(&SearchQuery::parse("-live")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_browse_includes_empty_directories() {
        let f = fixture();
        fs::create_dir_all(f.root.join("empty")).unwrap();
        touch(&f.root.join("song.mp3"));

        let cache = cache(&f);
        cache.fill().await.unwrap();

        let listings = cache.browse(None).unwrap();
        assert_eq!(listings.len(), 2);

        let empty = listings
            .iter()
            .find(|l| l.name == "@@abc/music/empty")
            .unwrap();
        assert!(empty.files.is_empty());

        let root = listings.iter().find(|l| l.name == "@@abc/music").unwrap();
        assert_eq!(root.files.len(), 1);
    }

    #[tokio::test]
    async fn test_list_directory_only_direct_children() {
        let f = fixture();
        fs::create_dir_all(f.root.join("rock")).unwrap();
        touch(&f.root.join("rock/a.mp3"));
        touch(&f.root.join("top.mp3"));

        let cache = cache(&f);
        cache.fill().await.unwrap();

        let listing = cache.list_directory("@@abc/music").unwrap().unwrap();
        assert_eq!(listing.files.len(), 1);
        assert!(listing.files[0].masked_filename.ends_with("top.mp3"));

        assert!(cache.list_directory("@@abc/other").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rescan_sweeps_deleted_files() {
        let f = fixture();
        touch(&f.root.join("keep.mp3"));
        touch(&f.root.join("gone.mp3"));

        let cache = cache(&f);
        let first = cache.fill().await.unwrap();
        assert_eq!(first.files, 2);

        fs::remove_file(f.root.join("gone.mp3")).unwrap();

        let second = cache.fill().await.unwrap();
        assert_eq!(second.files, 1);
        assert!(cache.resolve("@@abc/music/gone.mp3").unwrap().is_none());
        assert!(cache.resolve("@@abc/music/keep.mp3").unwrap().is_some());

        // 全文索引同样被清理
        assert!(cache.search(&SearchQuery::parse("gone")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_fill_never_sweeps() {
        let f = fixture();
        touch(&f.root.join("a.mp3"));
        touch(&f.root.join("b.mp3"));

        let cache = cache(&f);
        let first = cache.fill().await.unwrap();
        assert_eq!(first.files, 2);

        // 用已取消的主令牌构造新实例，模拟扫描中途被取消
        let master = CancellationToken::new();
        master.cancel();
        let cancelled_cache = ShareCache::new(&f.shares, &f.storage, master).unwrap();

        let summary = cancelled_cache.fill().await.unwrap();
        assert!(summary.cancelled);
        // 行数不少于取消前（墓碑清理被跳过）
        assert!(summary.files >= first.files);
        assert!(summary.directories >= first.directories);

        let state = cancelled_cache.current_state();
        assert!(state.cancelled);
        assert!(!state.filled);
        assert!(!state.faulted);
    }

    #[tokio::test]
    async fn test_try_load_restores_from_backup() {
        let f = fixture();
        touch(&f.root.join("song.mp3"));

        {
            let cache = cache(&f);
            cache.fill().await.unwrap();
        }

        // 活动库损毁
        fs::remove_file(&f.storage.cache_path).unwrap();

        let restored = cache(&f);
        assert!(restored.try_load().unwrap());
        assert!(restored.resolve("@@abc/music/song.mp3").unwrap().is_some());
        assert!(restored.current_state().filled);
    }

    #[tokio::test]
    async fn test_try_load_without_data() {
        let f = fixture();
        let cache = cache(&f);
        assert!(!cache.try_load().unwrap());
        assert!(!cache.current_state().filled);
    }

    #[tokio::test]
    async fn test_fill_rejects_concurrent_scan() {
        let f = fixture();
        let cache = Arc::new(cache(&f));

        // 持有扫描锁模拟进行中的扫描
        let guard = cache.fill_lock.try_lock().unwrap();
        let err = cache.fill().await.err().unwrap();
        assert!(matches!(err, ShareError::ScanInProgress));
        drop(guard);

        assert!(cache.fill().await.is_ok());
    }

    #[tokio::test]
    async fn test_counts_by_prefix() {
        let f = fixture();
        fs::create_dir_all(f.root.join("rock")).unwrap();
        touch(&f.root.join("rock/a.mp3"));
        touch(&f.root.join("b.mp3"));

        let cache = cache(&f);
        cache.fill().await.unwrap();

        assert_eq!(cache.count_files(None).unwrap(), 2);
        assert_eq!(cache.count_files(Some("@@abc/music/rock")).unwrap(), 1);
        assert_eq!(cache.count_directories(None).unwrap(), 2);
        assert_eq!(cache.count_directories(Some("@@abc/music")).unwrap(), 2);

        let dirs = cache.directories().unwrap();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].name, "@@abc/music");
        assert!(dirs[0].timestamp > 0);
    }
}
