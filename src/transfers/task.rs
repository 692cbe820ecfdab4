// 传输任务定义
//
// 台账状态的最小单元，只由上传服务在单传输互斥下修改

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// 上传
    Upload,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
        }
    }
}

/// 传输状态标志集
///
/// 终态总是包含 [`COMPLETED`](Self::COMPLETED)；
/// Succeeded/Cancelled/Errored/Rejected/TimedOut 互斥，且只与 Completed 组合出现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferStates(u16);

impl TransferStates {
    /// 空状态
    pub const NONE: TransferStates = TransferStates(0);
    /// 已入队
    pub const QUEUED: TransferStates = TransferStates(1 << 0);
    /// 初始化中
    pub const INITIALIZING: TransferStates = TransferStates(1 << 1);
    /// 传输中
    pub const IN_PROGRESS: TransferStates = TransferStates(1 << 2);
    /// 已结束（终态标志）
    pub const COMPLETED: TransferStates = TransferStates(1 << 3);
    /// 成功
    pub const SUCCEEDED: TransferStates = TransferStates(1 << 4);
    /// 被取消
    pub const CANCELLED: TransferStates = TransferStates(1 << 5);
    /// 出错
    pub const ERRORED: TransferStates = TransferStates(1 << 6);
    /// 被拒绝
    pub const REJECTED: TransferStates = TransferStates(1 << 7);
    /// 超时
    pub const TIMED_OUT: TransferStates = TransferStates(1 << 8);

    /// 组合两个标志集
    pub const fn with(self, other: TransferStates) -> TransferStates {
        TransferStates(self.0 | other.0)
    }

    /// 是否包含给定标志
    pub const fn contains(&self, flag: TransferStates) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// 是否为终态（包含 Completed）
    pub const fn is_terminal(&self) -> bool {
        self.contains(Self::COMPLETED)
    }

    /// 原始位值（用于持久化）
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// 从原始位值恢复
    pub const fn from_bits(bits: u16) -> TransferStates {
        TransferStates(bits)
    }
}

impl std::fmt::Display for TransferStates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(TransferStates, &str); 9] = [
            (TransferStates::QUEUED, "Queued"),
            (TransferStates::INITIALIZING, "Initializing"),
            (TransferStates::IN_PROGRESS, "InProgress"),
            (TransferStates::COMPLETED, "Completed"),
            (TransferStates::SUCCEEDED, "Succeeded"),
            (TransferStates::CANCELLED, "Cancelled"),
            (TransferStates::ERRORED, "Errored"),
            (TransferStates::REJECTED, "Rejected"),
            (TransferStates::TIMED_OUT, "TimedOut"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "None")?;
        }
        Ok(())
    }
}

/// 传输任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// 任务ID
    pub id: Uuid,
    /// 传输方向
    pub direction: TransferDirection,
    /// 对端用户名
    pub username: String,
    /// 掩码文件名（对外可见路径）
    pub filename: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 起始偏移
    pub start_offset: u64,
    /// 请求时间
    pub requested_at: DateTime<Utc>,
    /// 入队时间
    pub enqueued_at: Option<DateTime<Utc>>,
    /// 开始传输时间
    pub started_at: Option<DateTime<Utc>>,
    /// 结束时间
    pub ended_at: Option<DateTime<Utc>>,
    /// 累计传输字节数
    pub bytes_transferred: u64,
    /// 平均速度 (bytes/s)
    pub average_speed: f64,
    /// 状态标志集
    pub state: TransferStates,
    /// 异常信息
    pub exception: Option<String>,
    /// 软删除标记（仅终态可置位）
    pub removed: bool,
}

impl Transfer {
    /// 创建新的上传任务
    pub fn new_upload(username: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: TransferDirection::Upload,
            username: username.into(),
            filename: filename.into(),
            size,
            start_offset: 0,
            requested_at: Utc::now(),
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            bytes_transferred: 0,
            average_speed: 0.0,
            state: TransferStates::NONE,
            exception: None,
            removed: false,
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.size as f64) * 100.0
    }

    /// 是否处于终态
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 标记为已入队
    pub fn mark_queued(&mut self) {
        self.state = self.state.with(TransferStates::QUEUED);
        if self.enqueued_at.is_none() {
            self.enqueued_at = Some(Utc::now());
        }
    }

    /// 标记为传输中
    pub fn mark_in_progress(&mut self) {
        self.state = self.state.with(TransferStates::IN_PROGRESS);
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// 标记为成功结束
    pub fn mark_succeeded(&mut self) {
        self.state = TransferStates::COMPLETED.with(TransferStates::SUCCEEDED);
        self.ended_at = Some(Utc::now());
    }

    /// 标记为取消结束
    pub fn mark_cancelled(&mut self, message: impl Into<String>) {
        self.state = TransferStates::COMPLETED.with(TransferStates::CANCELLED);
        self.exception = Some(message.into());
        self.ended_at = Some(Utc::now());
    }

    /// 标记为出错结束
    pub fn mark_errored(&mut self, message: impl Into<String>) {
        self.state = TransferStates::COMPLETED.with(TransferStates::ERRORED);
        self.exception = Some(message.into());
        self.ended_at = Some(Utc::now());
    }

    /// 标记为被拒绝结束
    pub fn mark_rejected(&mut self, message: impl Into<String>) {
        self.state = TransferStates::COMPLETED.with(TransferStates::REJECTED);
        self.exception = Some(message.into());
        self.ended_at = Some(Utc::now());
    }

    /// 标记为超时结束
    pub fn mark_timed_out(&mut self, message: impl Into<String>) {
        self.state = TransferStates::COMPLETED.with(TransferStates::TIMED_OUT);
        self.exception = Some(message.into());
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_flag_operations() {
        let state = TransferStates::QUEUED.with(TransferStates::IN_PROGRESS);
        assert!(state.contains(TransferStates::QUEUED));
        assert!(state.contains(TransferStates::IN_PROGRESS));
        assert!(!state.contains(TransferStates::COMPLETED));
        assert!(!state.is_terminal());

        let terminal = TransferStates::COMPLETED.with(TransferStates::SUCCEEDED);
        assert!(terminal.is_terminal());

        // 位值往返
        assert_eq!(TransferStates::from_bits(terminal.bits()), terminal);
    }

    #[test]
    fn test_states_display() {
        assert_eq!(TransferStates::NONE.to_string(), "None");
        assert_eq!(
            TransferStates::COMPLETED
                .with(TransferStates::CANCELLED)
                .to_string(),
            "Completed|Cancelled"
        );
    }

    #[test]
    fn test_transfer_creation() {
        let transfer = Transfer::new_upload("alice", "@@abc/music/a.mp3", 1024);
        assert_eq!(transfer.direction, TransferDirection::Upload);
        assert_eq!(transfer.state, TransferStates::NONE);
        assert_eq!(transfer.bytes_transferred, 0);
        assert!(!transfer.removed);
        assert!(!transfer.is_terminal());
    }

    #[test]
    fn test_progress_calculation() {
        let mut transfer = Transfer::new_upload("alice", "f", 1000);
        transfer.bytes_transferred = 250;
        assert_eq!(transfer.progress(), 25.0);

        transfer.size = 0;
        assert_eq!(transfer.progress(), 0.0);
    }

    #[test]
    fn test_lifecycle_marks() {
        let mut transfer = Transfer::new_upload("alice", "f", 1000);

        transfer.mark_queued();
        assert!(transfer.state.contains(TransferStates::QUEUED));
        assert!(transfer.enqueued_at.is_some());

        transfer.mark_in_progress();
        assert!(transfer.started_at.is_some());

        transfer.mark_succeeded();
        assert!(transfer.is_terminal());
        assert!(transfer.state.contains(TransferStates::SUCCEEDED));
        assert!(transfer.ended_at.is_some());
        // 终态覆盖此前的进行中标志
        assert!(!transfer.state.contains(TransferStates::QUEUED));
    }

    #[test]
    fn test_terminal_marks_are_exclusive() {
        let mut a = Transfer::new_upload("alice", "f", 1);
        a.mark_cancelled("用户取消");
        assert_eq!(
            a.state,
            TransferStates::COMPLETED.with(TransferStates::CANCELLED)
        );
        assert_eq!(a.exception.as_deref(), Some("用户取消"));

        let mut b = Transfer::new_upload("alice", "f", 1);
        b.mark_errored("io error");
        assert_eq!(
            b.state,
            TransferStates::COMPLETED.with(TransferStates::ERRORED)
        );

        let mut c = Transfer::new_upload("alice", "f", 1);
        c.mark_timed_out("peer 无响应");
        assert!(c.state.contains(TransferStates::TIMED_OUT));
        assert!(!c.state.contains(TransferStates::ERRORED));
    }
}
