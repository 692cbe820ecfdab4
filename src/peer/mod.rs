//! Peer 协议库接入层
//!
//! 协议编解码由外部 peer 协议库完成，本模块只定义双方交互的窄接口：
//! 上传服务通过 [`UploadDelegate`] 把限速、槽位、状态与进度回调交给协议库，
//! 协议库通过 [`PeerClient::upload`] 驱动整个传输

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transfers::governor::GovernorError;
use crate::transfers::queue::QueueError;
use crate::transfers::task::TransferStates;

/// peer 协议层错误
#[derive(Debug)]
pub enum PeerError {
    /// 传输被取消
    Cancelled(String),
    /// 对端拒绝
    Rejected(String),
    /// 传输超时
    TimedOut(String),
    /// 其他错误
    Other(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled(msg) => write!(f, "传输被取消: {}", msg),
            Self::Rejected(msg) => write!(f, "对端拒绝传输: {}", msg),
            Self::TimedOut(msg) => write!(f, "传输超时: {}", msg),
            Self::Other(msg) => write!(f, "peer 协议错误: {}", msg),
        }
    }
}

impl std::error::Error for PeerError {}

/// 上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// 传输ID
    pub id: Uuid,
    /// 对端用户名
    pub username: String,
    /// 掩码文件名
    pub filename: String,
    /// 文件大小（字节）
    pub size: u64,
}

/// 状态变更事件（协议库上报）
#[derive(Debug, Clone, Copy)]
pub struct TransferStateUpdate {
    /// 新增的状态标志
    pub states: TransferStates,
}

/// 进度事件（协议库上报）
#[derive(Debug, Clone, Copy)]
pub struct TransferProgressUpdate {
    /// 累计传输字节数
    pub bytes_transferred: u64,
    /// 平均速度 (bytes/s)
    pub average_speed: f64,
}

/// 传输结束快照（协议库返回）
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadSnapshot {
    /// 起始偏移
    pub start_offset: u64,
    /// 累计传输字节数
    pub bytes_transferred: u64,
    /// 平均速度 (bytes/s)
    pub average_speed: f64,
}

/// 上传回调接口
///
/// 协议库在传输全程调用这些回调：
/// - `await_slot` 在开始发送前阻塞等待队列准入
/// - 每个发送批次先 `grant_bytes` 领取配额，发送后用 `return_bytes` 归还未用部分
/// - 读文件用 `open_stream(offset)` 获取已定位的流，协议库不自行 seek，
///   传输结束时直接丢弃该流
#[async_trait]
pub trait UploadDelegate: Send + Sync {
    /// 状态变更回调
    async fn state_changed(&self, update: TransferStateUpdate);

    /// 进度回调（高频，内部节流）
    async fn progress_updated(&self, update: TransferProgressUpdate);

    /// 领取发送配额，返回的字节数可能小于请求值
    async fn grant_bytes(
        &self,
        requested: u64,
        ct: &CancellationToken,
    ) -> Result<u64, GovernorError>;

    /// 归还未使用的配额
    async fn return_bytes(&self, attempted: u64, granted: u64, actual: u64);

    /// 等待上传槽位准入
    async fn await_slot(&self, ct: &CancellationToken) -> Result<(), QueueError>;

    /// 释放上传槽位（传输结束时调用，无论成败）
    async fn release_slot(&self);

    /// 打开输入流并定位到 offset
    async fn open_stream(&self, offset: u64)
        -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// peer 协议客户端（外部库实现）
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// 执行一次完整上传，返回结束快照
    async fn upload(
        &self,
        request: UploadRequest,
        delegate: Arc<dyn UploadDelegate>,
        ct: CancellationToken,
    ) -> Result<UploadSnapshot, PeerError>;
}
