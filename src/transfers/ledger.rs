//! 传输台账 SQLite 数据库模块
//!
//! 每一次传输尝试的持久化记录，行只软删除、从不销毁
//! 读取为快照语义，所有时间均为 UTC

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::task::{Transfer, TransferDirection, TransferStates};

/// 列表查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct TransferListFilter {
    /// 按用户名过滤
    pub username: Option<String>,
    /// 按掩码文件名过滤
    pub filename: Option<String>,
    /// 是否包含已软删除的行
    pub include_removed: bool,
}

/// 传输台账管理器
pub struct TransferLedger {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

impl TransferLedger {
    /// 创建新的台账管理器
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_tables()?;
        Ok(ledger)
    }

    /// 创建内存台账（测试用）
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_tables()?;
        Ok(ledger)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                username TEXT NOT NULL,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                start_offset INTEGER NOT NULL DEFAULT 0,
                requested_at INTEGER NOT NULL,
                enqueued_at INTEGER,
                started_at INTEGER,
                ended_at INTEGER,
                bytes_transferred INTEGER NOT NULL DEFAULT 0,
                average_speed REAL NOT NULL DEFAULT 0,
                state INTEGER NOT NULL DEFAULT 0,
                exception TEXT,
                removed INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transfers_user_file
             ON transfers(username, filename, removed)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transfers_ended ON transfers(ended_at)",
            [],
        )?;

        info!("传输台账表初始化完成");
        Ok(())
    }

    // ========================================================================
    // 写入
    // ========================================================================

    /// 新增记录并取代旧记录
    ///
    /// 同一 (username, filename) 的未删除旧行先被标记为 removed，再插入新行
    pub fn add_or_supersede(&self, transfer: &Transfer) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let superseded = tx.execute(
            "UPDATE transfers SET removed = 1
             WHERE username = ?1 AND filename = ?2 AND removed = 0",
            params![transfer.username, transfer.filename],
        )?;
        if superseded > 0 {
            debug!(
                "取代 {} 条旧传输记录: username={}, filename={}",
                superseded, transfer.username, transfer.filename
            );
        }

        tx.execute(
            r#"
            INSERT INTO transfers (
                id, direction, username, filename, size, start_offset,
                requested_at, enqueued_at, started_at, ended_at,
                bytes_transferred, average_speed, state, exception, removed
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15
            )
            "#,
            params![
                transfer.id.to_string(),
                transfer.direction.as_str(),
                transfer.username,
                transfer.filename,
                transfer.size as i64,
                transfer.start_offset as i64,
                transfer.requested_at.timestamp_millis(),
                transfer.enqueued_at.map(|t| t.timestamp_millis()),
                transfer.started_at.map(|t| t.timestamp_millis()),
                transfer.ended_at.map(|t| t.timestamp_millis()),
                transfer.bytes_transferred as i64,
                transfer.average_speed,
                transfer.state.bits() as i64,
                transfer.exception,
                if transfer.removed { 1 } else { 0 },
            ],
        )?;

        tx.commit()?;
        debug!("已写入传输记录: {}", transfer.id);
        Ok(())
    }

    /// 更新已有记录
    pub fn update(&self, transfer: &Transfer) -> Result<()> {
        let conn = self.lock_conn()?;

        let updated = conn.execute(
            r#"
            UPDATE transfers SET
                size = ?2, start_offset = ?3,
                requested_at = ?4, enqueued_at = ?5, started_at = ?6, ended_at = ?7,
                bytes_transferred = ?8, average_speed = ?9,
                state = ?10, exception = ?11, removed = ?12
            WHERE id = ?1
            "#,
            params![
                transfer.id.to_string(),
                transfer.size as i64,
                transfer.start_offset as i64,
                transfer.requested_at.timestamp_millis(),
                transfer.enqueued_at.map(|t| t.timestamp_millis()),
                transfer.started_at.map(|t| t.timestamp_millis()),
                transfer.ended_at.map(|t| t.timestamp_millis()),
                transfer.bytes_transferred as i64,
                transfer.average_speed,
                transfer.state.bits() as i64,
                transfer.exception,
                if transfer.removed { 1 } else { 0 },
            ],
        )?;

        if updated == 0 {
            anyhow::bail!("传输记录不存在: {}", transfer.id);
        }
        Ok(())
    }

    /// 软删除记录
    pub fn mark_removed(&self, id: Uuid) -> Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE transfers SET removed = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if updated > 0 {
            info!("传输记录已软删除: {}", id);
        }
        Ok(updated > 0)
    }

    /// 清理过期记录
    ///
    /// 只删除已软删除且处于终态的过期行
    pub fn prune(&self, retention_days: u64) -> Result<usize> {
        let conn = self.lock_conn()?;
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).timestamp_millis();

        let deleted = conn.execute(
            "DELETE FROM transfers
             WHERE removed = 1 AND (state & ?1) != 0
               AND ended_at IS NOT NULL AND ended_at < ?2",
            params![TransferStates::COMPLETED.bits() as i64, cutoff],
        )?;

        if deleted > 0 {
            info!("已清理 {} 条过期传输记录（超过 {} 天）", deleted, retention_days);
        }
        Ok(deleted)
    }

    // ========================================================================
    // 读取
    // ========================================================================

    /// 按 ID 查找
    pub fn find(&self, id: Uuid) -> Result<Option<Transfer>> {
        let conn = self.lock_conn()?;

        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", Self::SELECT_PREFIX),
                params![id.to_string()],
                Self::map_row,
            )
            .optional()?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transfer(row)?)),
            None => Ok(None),
        }
    }

    /// 查找 (username, filename) 下未删除且未终态的记录
    pub fn find_active(&self, username: &str, filename: &str) -> Result<Vec<Transfer>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE username = ?1 AND filename = ?2
               AND removed = 0 AND (state & ?3) = 0",
            Self::SELECT_PREFIX
        ))?;

        let rows = stmt.query_map(
            params![username, filename, TransferStates::COMPLETED.bits() as i64],
            Self::map_row,
        )?;

        Self::collect_rows(rows)
    }

    /// 列出记录
    pub fn list(&self, filter: &TransferListFilter) -> Result<Vec<Transfer>> {
        let conn = self.lock_conn()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.include_removed {
            clauses.push("removed = 0".to_string());
        }
        if let Some(ref username) = filter.username {
            args.push(Box::new(username.clone()));
            clauses.push(format!("username = ?{}", args.len()));
        }
        if let Some(ref filename) = filter.filename {
            args.push(Box::new(filename.clone()));
            clauses.push(format!("filename = ?{}", args.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let sql = format!(
            "{}{} ORDER BY requested_at DESC",
            Self::SELECT_PREFIX,
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;

        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), Self::map_row)?;

        Self::collect_rows(rows)
    }

    // ========================================================================
    // 辅助方法
    // ========================================================================

    const SELECT_PREFIX: &'static str = "SELECT
            id, direction, username, filename, size, start_offset,
            requested_at, enqueued_at, started_at, ended_at,
            bytes_transferred, average_speed, state, exception, removed
        FROM transfers";

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRow> {
        Ok(TransferRow {
            id: row.get(0)?,
            direction: row.get(1)?,
            username: row.get(2)?,
            filename: row.get(3)?,
            size: row.get(4)?,
            start_offset: row.get(5)?,
            requested_at: row.get(6)?,
            enqueued_at: row.get(7)?,
            started_at: row.get(8)?,
            ended_at: row.get(9)?,
            bytes_transferred: row.get(10)?,
            average_speed: row.get(11)?,
            state: row.get(12)?,
            exception: row.get(13)?,
            removed: row.get(14)?,
        })
    }

    fn collect_rows(
        rows: impl Iterator<Item = rusqlite::Result<TransferRow>>,
    ) -> Result<Vec<Transfer>> {
        let mut transfers = Vec::new();
        for row in rows {
            match row {
                Ok(r) => match Self::row_to_transfer(r) {
                    Ok(transfer) => transfers.push(transfer),
                    Err(e) => warn!("转换传输记录失败: {}", e),
                },
                Err(e) => warn!("读取传输记录行失败: {}", e),
            }
        }
        Ok(transfers)
    }

    /// 将数据库行转换为 Transfer
    fn row_to_transfer(row: TransferRow) -> Result<Transfer> {
        let direction = match row.direction.as_str() {
            "upload" => TransferDirection::Upload,
            other => return Err(anyhow!("未知的传输方向: {}", other)),
        };

        let to_datetime = |ms: i64| -> DateTime<Utc> {
            Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
        };

        Ok(Transfer {
            id: Uuid::parse_str(&row.id)?,
            direction,
            username: row.username,
            filename: row.filename,
            size: row.size as u64,
            start_offset: row.start_offset as u64,
            requested_at: to_datetime(row.requested_at),
            enqueued_at: row.enqueued_at.map(to_datetime),
            started_at: row.started_at.map(to_datetime),
            ended_at: row.ended_at.map(to_datetime),
            bytes_transferred: row.bytes_transferred as u64,
            average_speed: row.average_speed,
            state: TransferStates::from_bits(row.state as u16),
            exception: row.exception,
            removed: row.removed != 0,
        })
    }
}

/// 传输记录行
struct TransferRow {
    id: String,
    direction: String,
    username: String,
    filename: String,
    size: i64,
    start_offset: i64,
    requested_at: i64,
    enqueued_at: Option<i64>,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    bytes_transferred: i64,
    average_speed: f64,
    state: i64,
    exception: Option<String>,
    removed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_find_roundtrip() {
        let ledger = TransferLedger::in_memory().unwrap();

        let mut transfer = Transfer::new_upload("alice", "@@abc/music/a.mp3", 1024);
        transfer.mark_queued();
        ledger.add_or_supersede(&transfer).unwrap();

        let loaded = ledger.find(transfer.id).unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.filename, "@@abc/music/a.mp3");
        assert_eq!(loaded.size, 1024);
        assert!(loaded.state.contains(TransferStates::QUEUED));
        assert!(loaded.enqueued_at.is_some());
        assert!(!loaded.removed);

        assert!(ledger.find(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_supersede_marks_previous_removed() {
        let ledger = TransferLedger::in_memory().unwrap();

        let mut old = Transfer::new_upload("alice", "f.mp3", 10);
        old.mark_errored("网络错误");
        ledger.add_or_supersede(&old).unwrap();

        let new = Transfer::new_upload("alice", "f.mp3", 10);
        ledger.add_or_supersede(&new).unwrap();

        // 旧行被软删除，新行未删除且非终态
        let old_loaded = ledger.find(old.id).unwrap().unwrap();
        assert!(old_loaded.removed);

        let new_loaded = ledger.find(new.id).unwrap().unwrap();
        assert!(!new_loaded.removed);
        assert!(!new_loaded.is_terminal());

        // 其它用户的记录不受影响
        let other = Transfer::new_upload("bob", "f.mp3", 10);
        ledger.add_or_supersede(&other).unwrap();
        assert!(!ledger.find(new.id).unwrap().unwrap().removed);
    }

    #[test]
    fn test_find_active_excludes_terminal_and_removed() {
        let ledger = TransferLedger::in_memory().unwrap();

        let mut done = Transfer::new_upload("alice", "f.mp3", 10);
        done.mark_succeeded();
        ledger.add_or_supersede(&done).unwrap();

        assert!(ledger.find_active("alice", "f.mp3").unwrap().is_empty());

        let active = Transfer::new_upload("alice", "f.mp3", 10);
        ledger.add_or_supersede(&active).unwrap();

        let found = ledger.find_active("alice", "f.mp3").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, active.id);
    }

    #[test]
    fn test_update_persists_state() {
        let ledger = TransferLedger::in_memory().unwrap();

        let mut transfer = Transfer::new_upload("alice", "f.mp3", 100);
        ledger.add_or_supersede(&transfer).unwrap();

        transfer.mark_in_progress();
        transfer.bytes_transferred = 50;
        transfer.average_speed = 12.5;
        ledger.update(&transfer).unwrap();

        let loaded = ledger.find(transfer.id).unwrap().unwrap();
        assert_eq!(loaded.bytes_transferred, 50);
        assert_eq!(loaded.average_speed, 12.5);
        assert!(loaded.state.contains(TransferStates::IN_PROGRESS));

        // 更新不存在的记录报错
        let ghost = Transfer::new_upload("ghost", "g.mp3", 1);
        assert!(ledger.update(&ghost).is_err());
    }

    #[test]
    fn test_list_with_filters() {
        let ledger = TransferLedger::in_memory().unwrap();

        let a = Transfer::new_upload("alice", "a.mp3", 1);
        let b = Transfer::new_upload("bob", "b.mp3", 1);
        ledger.add_or_supersede(&a).unwrap();
        ledger.add_or_supersede(&b).unwrap();
        ledger.mark_removed(b.id).unwrap();

        // 默认不含已删除
        let all = ledger.list(&TransferListFilter::default()).unwrap();
        assert_eq!(all.len(), 1);

        let with_removed = ledger
            .list(&TransferListFilter {
                include_removed: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(with_removed.len(), 2);

        let alice_only = ledger
            .list(&TransferListFilter {
                username: Some("alice".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(alice_only.len(), 1);
        assert_eq!(alice_only[0].username, "alice");
    }

    #[test]
    fn test_prune_only_removed_terminal_rows() {
        let ledger = TransferLedger::in_memory().unwrap();

        // 过期的已删除终态行
        let mut old = Transfer::new_upload("alice", "old.mp3", 1);
        old.mark_succeeded();
        old.ended_at = Some(Utc::now() - Duration::days(60));
        old.removed = true;
        ledger.add_or_supersede(&old).unwrap();

        // 过期但未删除的终态行
        let mut kept = Transfer::new_upload("alice", "kept.mp3", 1);
        kept.mark_succeeded();
        kept.ended_at = Some(Utc::now() - Duration::days(60));
        ledger.add_or_supersede(&kept).unwrap();

        let deleted = ledger.prune(30).unwrap();
        assert_eq!(deleted, 1);
        assert!(ledger.find(old.id).unwrap().is_none());
        assert!(ledger.find(kept.id).unwrap().is_some());
    }
}
