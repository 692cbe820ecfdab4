//! 上传服务
//!
//! 单传输生命周期编排：准入、持久化、取消、进度节流与终态上报。
//! 每个活跃传输对应一个后台任务和一个挂在进程关闭令牌下的取消源，
//! 所有台账写入都在该传输自己的互斥下进行

use async_trait::async_trait;
use dashmap::DashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::peer::{
    PeerClient, PeerError, TransferProgressUpdate, TransferStateUpdate, UploadDelegate,
    UploadRequest,
};
use crate::relay::AgentRelay;
use crate::shares::types::{host_for, LOCAL_HOST};
use crate::shares::ShareCache;

use super::governor::{GovernorError, UploadGovernor};
use super::ledger::{TransferLedger, TransferListFilter};
use super::queue::{QueueError, UploadQueue};
use super::task::{Transfer, TransferStates};

/// 入队错误
#[derive(Debug)]
pub enum EnqueueError {
    /// 文件未共享（掩码名解析失败）
    NotShared,
    /// 解析成功但物理文件缺失
    FileNotFound,
    /// 存储层错误
    Storage(String),
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotShared => write!(f, "文件未共享"),
            Self::FileNotFound => write!(f, "共享文件不存在"),
            Self::Storage(msg) => write!(f, "存储层错误: {}", msg),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// 传输操作错误
#[derive(Debug)]
pub enum TransferError {
    /// 传输记录不存在
    NotFound,
    /// 非法操作（如删除非终态传输）
    InvalidOperation(String),
    /// 存储层错误
    Storage(String),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "传输记录不存在"),
            Self::InvalidOperation(msg) => write!(f, "非法操作: {}", msg),
            Self::Storage(msg) => write!(f, "存储层错误: {}", msg),
        }
    }
}

impl std::error::Error for TransferError {}

/// 活跃传输信息（任务状态 + 取消令牌）
struct ActiveUpload {
    transfer: Arc<Mutex<Transfer>>,
    token: CancellationToken,
}

/// 上传服务
pub struct UploadService {
    /// peer 协议客户端
    client: Arc<dyn PeerClient>,
    /// 共享索引
    cache: Arc<ShareCache>,
    /// 传输台账
    ledger: Arc<TransferLedger>,
    /// 槽位队列
    queue: Arc<UploadQueue>,
    /// 限速器
    governor: Arc<UploadGovernor>,
    /// 代理中继（未配置时仅支持本机共享）
    relay: Option<Arc<dyn AgentRelay>>,
    /// 活跃传输表
    active: Arc<DashMap<Uuid, ActiveUpload>>,
    /// 进程关闭令牌
    shutdown: CancellationToken,
}

impl UploadService {
    /// 创建上传服务
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn PeerClient>,
        cache: Arc<ShareCache>,
        ledger: Arc<TransferLedger>,
        queue: Arc<UploadQueue>,
        governor: Arc<UploadGovernor>,
        relay: Option<Arc<dyn AgentRelay>>,
        shutdown: CancellationToken,
    ) -> Self {
        info!("创建上传服务");
        Self {
            client,
            cache,
            ledger,
            queue,
            governor,
            relay,
            active: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    // ========================================================================
    // 入队
    // ========================================================================

    /// 受理一次上传请求
    ///
    /// 解析掩码名、校验物理文件、幂等检查后写入台账并启动后台传输任务。
    /// 同 (username, filename) 已有未终态记录时为幂等操作，返回已有记录 ID
    pub async fn enqueue(&self, username: &str, filename: &str) -> Result<Uuid, EnqueueError> {
        // 1. 解析掩码名
        let resolved = self
            .cache
            .resolve(filename)
            .map_err(|e| EnqueueError::Storage(e.to_string()))?;
        let Some(resolved) = resolved else {
            info!("上传被拒绝，文件未共享: username={}, filename={}", username, filename);
            return Err(EnqueueError::NotShared);
        };

        let original = PathBuf::from(&resolved.original_filename);
        let host = host_for(self.cache.shares(), &original)
            .unwrap_or_else(|| LOCAL_HOST.to_string());

        // 2. 校验物理文件并读取长度
        let length = if host == LOCAL_HOST {
            match tokio::fs::metadata(&original).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => {
                    warn!("共享文件在磁盘上缺失，触发重新扫描: {:?}", original);
                    let cache = self.cache.clone();
                    tokio::spawn(async move {
                        if let Err(e) = cache.fill().await {
                            warn!("缺失文件触发的重新扫描失败: {}", e);
                        }
                    });
                    return Err(EnqueueError::FileNotFound);
                }
            }
        } else {
            let Some(relay) = self.relay.as_ref() else {
                warn!("共享挂在代理 {} 上但未配置中继", host);
                return Err(EnqueueError::FileNotFound);
            };
            match relay.get_file_info(&host, &resolved.original_filename).await {
                Ok(info) if info.exists => info.length,
                Ok(_) => {
                    warn!(
                        "代理节点上文件缺失: agent={}, filename={}",
                        host, resolved.original_filename
                    );
                    return Err(EnqueueError::FileNotFound);
                }
                Err(e) => {
                    warn!("查询代理文件信息失败: agent={}, 错误: {}", host, e);
                    return Err(EnqueueError::Storage(e.to_string()));
                }
            }
        };

        // 3. 幂等检查：已有未终态记录时不重复受理
        let existing = self
            .ledger
            .find_active(username, filename)
            .map_err(|e| EnqueueError::Storage(e.to_string()))?;
        if let Some(first) = existing.first() {
            info!(
                "传输已在进行，忽略重复请求: username={}, filename={}, id={}",
                username, filename, first.id
            );
            return Ok(first.id);
        }

        // 4. 新建记录并取代旧记录
        let transfer = Transfer::new_upload(username, filename, length);
        let id = transfer.id;
        self.ledger
            .add_or_supersede(&transfer)
            .map_err(|e| EnqueueError::Storage(e.to_string()))?;

        // 5. 注册取消源（挂在进程关闭令牌下）
        let token = self.shutdown.child_token();
        let transfer = Arc::new(Mutex::new(transfer));
        self.active.insert(
            id,
            ActiveUpload {
                transfer: transfer.clone(),
                token: token.clone(),
            },
        );

        info!(
            "上传已受理: id={}, username={}, filename={}, size={}, host={}",
            id, username, filename, length, host
        );

        // 6. 启动后台传输任务（不等待）
        self.spawn_upload(UploadRequest {
            id,
            username: username.to_string(),
            filename: filename.to_string(),
            size: length,
        }, host, resolved.original_filename, transfer, token);

        Ok(id)
    }

    /// 启动后台传输任务
    fn spawn_upload(
        &self,
        request: UploadRequest,
        host: String,
        original_filename: String,
        transfer: Arc<Mutex<Transfer>>,
        token: CancellationToken,
    ) {
        let harness = Arc::new(TransferHarness {
            id: request.id,
            username: request.username.clone(),
            filename: request.filename.clone(),
            host: host.clone(),
            original_filename,
            transfer,
            ledger: self.ledger.clone(),
            queue: self.queue.clone(),
            governor: self.governor.clone(),
            relay: self.relay.clone(),
            throttle: ProgressThrottle::new(),
            shutdown: self.shutdown.clone(),
        });

        let client = self.client.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let id = request.id;
            let result = client
                .upload(request, harness.clone() as Arc<dyn UploadDelegate>, token)
                .await;

            Self::finish_upload(&harness, result).await;

            // finally：移除取消源
            active.remove(&id);
        });
    }

    /// 终态处理
    ///
    /// 在单传输互斥下写入终态；终态是该传输最后一次持久化，
    /// 之后的进度回调会被 harness 丢弃
    async fn finish_upload(
        harness: &TransferHarness,
        result: Result<crate::peer::UploadSnapshot, PeerError>,
    ) {
        let mut close_error: Option<String> = None;

        {
            let mut transfer = harness.transfer.lock().await;
            if !transfer.is_terminal() {
                match result {
                    Ok(snapshot) => {
                        transfer.start_offset = snapshot.start_offset;
                        transfer.bytes_transferred = snapshot.bytes_transferred;
                        transfer.average_speed = snapshot.average_speed;
                        transfer.mark_succeeded();
                        info!(
                            "✅ 上传完成: id={}, username={}, bytes={}",
                            harness.id, harness.username, snapshot.bytes_transferred
                        );
                    }
                    Err(PeerError::Cancelled(msg)) => {
                        transfer.mark_cancelled(msg.clone());
                        close_error = Some(msg.clone());
                        warn!("上传已取消: id={}, 原因: {}", harness.id, msg);
                    }
                    Err(PeerError::Rejected(msg)) => {
                        transfer.mark_rejected(msg.clone());
                        warn!("上传被拒绝: id={}, 原因: {}", harness.id, msg);
                    }
                    Err(PeerError::TimedOut(msg)) => {
                        transfer.mark_timed_out(msg.clone());
                        warn!("上传超时: id={}, 原因: {}", harness.id, msg);
                    }
                    Err(PeerError::Other(msg)) => {
                        transfer.mark_errored(msg.clone());
                        error!("上传失败: id={}, 错误: {}", harness.id, msg);
                    }
                }

                if let Err(e) = harness.ledger.update(&transfer) {
                    error!("持久化传输终态失败: id={}, 错误: {}", harness.id, e);
                }
            }
        }

        // 远端流善后
        if close_error.is_some() && harness.host != LOCAL_HOST {
            if let Some(relay) = harness.relay.as_ref() {
                relay
                    .try_close_file_stream(&harness.host, harness.id, close_error)
                    .await;
            }
        }
    }

    // ========================================================================
    // 控制平面
    // ========================================================================

    /// 取消传输
    ///
    /// 原子移除并触发取消源，返回是否发出了取消信号
    pub fn try_cancel(&self, id: Uuid) -> bool {
        if let Some((_, active)) = self.active.remove(&id) {
            active.token.cancel();
            info!("已请求取消传输: {}", id);
            true
        } else {
            false
        }
    }

    /// 软删除传输记录
    ///
    /// 仅终态传输可删除
    pub fn remove(&self, id: Uuid) -> Result<(), TransferError> {
        let transfer = self
            .ledger
            .find(id)
            .map_err(|e| TransferError::Storage(e.to_string()))?
            .ok_or(TransferError::NotFound)?;

        if !transfer.is_terminal() {
            return Err(TransferError::InvalidOperation(format!(
                "传输未结束，当前状态: {}",
                transfer.state
            )));
        }

        self.ledger
            .mark_removed(id)
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        Ok(())
    }

    /// 按 ID 查找传输记录
    pub fn find(&self, id: Uuid) -> Result<Option<Transfer>, TransferError> {
        self.ledger
            .find(id)
            .map_err(|e| TransferError::Storage(e.to_string()))
    }

    /// 列出传输记录
    pub fn list(&self, filter: &TransferListFilter) -> Result<Vec<Transfer>, TransferError> {
        self.ledger
            .list(filter)
            .map_err(|e| TransferError::Storage(e.to_string()))
    }

    /// 活跃传输数
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

// ============================================================================
// 回调实现
// ============================================================================

/// 进度持久化间隔（毫秒）
const PROGRESS_PERSIST_INTERVAL_MS: u64 = 250;

/// 进度持久化节流
///
/// peer 库的进度回调高频到达，台账写入合并为一个间隔内至多一次，
/// 落下的中间值由终态写入兜底；CAS 时间戳避免在回调路径上加锁
struct ProgressThrottle {
    /// 上次落库的时间戳（纳秒，0 表示从未落库）
    last_persist_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottle {
    fn new() -> Self {
        Self::with_interval(Duration::from_millis(PROGRESS_PERSIST_INTERVAL_MS))
    }

    fn with_interval(interval: Duration) -> Self {
        Self {
            last_persist_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 本次进度是否应该落库
    ///
    /// 首次调用总是放行；之后距上次落库超过间隔才放行。
    /// CAS 失败说明被并发回调抢先，本次直接丢弃
    fn should_persist(&self) -> bool {
        // 0 保留为"从未落库"标记
        let now_nanos = Self::now_nanos().max(1);
        let last = self.last_persist_nanos.load(Ordering::Relaxed);

        if last != 0 && now_nanos.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_persist_nanos
            .compare_exchange_weak(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 当前时间的纳秒表示
    ///
    /// 以进程级起始时刻为基准，跨线程可比；使用 Instant 避免系统时钟跳变影响
    fn now_nanos() -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// 单传输回调环境
///
/// 实现 peer 协议库消费的 [`UploadDelegate`] 接口；
/// `transfer` 的互斥即该传输的持久化互斥
struct TransferHarness {
    id: Uuid,
    username: String,
    /// 掩码文件名
    filename: String,
    /// 宿主（本机哨兵或代理名）
    host: String,
    /// 物理文件路径
    original_filename: String,
    transfer: Arc<Mutex<Transfer>>,
    ledger: Arc<TransferLedger>,
    queue: Arc<UploadQueue>,
    governor: Arc<UploadGovernor>,
    relay: Option<Arc<dyn AgentRelay>>,
    /// 进度持久化节流
    throttle: ProgressThrottle,
    shutdown: CancellationToken,
}

#[async_trait]
impl UploadDelegate for TransferHarness {
    async fn state_changed(&self, update: TransferStateUpdate) {
        let mut transfer = self.transfer.lock().await;
        if transfer.is_terminal() {
            return;
        }

        let newly_queued = update.states.contains(TransferStates::QUEUED)
            && !transfer.state.contains(TransferStates::QUEUED);

        transfer.state = transfer.state.with(update.states);
        if newly_queued {
            transfer.mark_queued();
            self.queue.enqueue(&self.username, &self.filename).await;
        }
        if update.states.contains(TransferStates::IN_PROGRESS) {
            transfer.mark_in_progress();
        }

        debug!("传输状态变更: id={}, state={}", self.id, transfer.state);

        // 进程关闭中跳过持久化
        if !self.shutdown.is_cancelled() {
            if let Err(e) = self.ledger.update(&transfer) {
                warn!("持久化状态变更失败: id={}, 错误: {}", self.id, e);
            }
        }
    }

    async fn progress_updated(&self, update: TransferProgressUpdate) {
        if !self.throttle.should_persist() {
            return;
        }

        let mut transfer = self.transfer.lock().await;
        // 终态之后不再落任何进度
        if transfer.is_terminal() {
            return;
        }

        transfer.bytes_transferred = update.bytes_transferred;
        transfer.average_speed = update.average_speed;

        if let Err(e) = self.ledger.update(&transfer) {
            warn!("持久化进度失败: id={}, 错误: {}", self.id, e);
        }
    }

    async fn grant_bytes(
        &self,
        requested: u64,
        ct: &CancellationToken,
    ) -> Result<u64, GovernorError> {
        self.governor.get_bytes(&self.username, requested, ct).await
    }

    async fn return_bytes(&self, attempted: u64, granted: u64, actual: u64) {
        self.governor
            .return_bytes(&self.username, attempted, granted, actual)
            .await;
    }

    async fn await_slot(&self, ct: &CancellationToken) -> Result<(), QueueError> {
        let receiver = self.queue.await_start(&self.username, &self.filename).await?;

        tokio::select! {
            _ = ct.cancelled() => Err(QueueError::Cancelled),
            result = receiver => match result {
                Ok(()) => Ok(()),
                // 发送端随队列重建消失
                Err(_) => Err(QueueError::Cancelled),
            },
        }
    }

    async fn release_slot(&self) {
        self.queue.complete(&self.username, &self.filename).await;
    }

    async fn open_stream(
        &self,
        offset: u64,
    ) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
        if self.host == LOCAL_HOST {
            let mut file = tokio::fs::File::open(&self.original_filename).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            Ok(Box::new(file))
        } else {
            let relay = self
                .relay
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("代理中继未配置"))?;
            relay
                .get_file_stream(&self.host, &self.original_filename, offset, self.id)
                .await
        }
    }
}
