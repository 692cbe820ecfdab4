// 应用状态

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AppConfig, UploadOptions};
use crate::logging::{self, LogGuard};
use crate::peer::PeerClient;
use crate::relay::AgentRelay;
use crate::shares::ShareCache;
use crate::transfers::{TransferLedger, UploadGovernor, UploadQueue, UploadService};
use crate::users::{ConfigUserService, UserService};

/// 应用全局状态
///
/// 上传编排核心的组装根：按依赖顺序装配台账、共享索引、限速器、
/// 队列与上传服务，并持有进程级关闭令牌
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<RwLock<AppConfig>>,
    /// 进程关闭令牌（取消所有传输与扫描）
    pub shutdown: CancellationToken,
    /// 共享索引
    pub cache: Arc<ShareCache>,
    /// 传输台账
    pub ledger: Arc<TransferLedger>,
    /// 上传槽位队列
    pub queue: Arc<UploadQueue>,
    /// 上传限速器
    pub governor: Arc<UploadGovernor>,
    /// 上传服务
    pub uploads: Arc<UploadService>,
    /// 用户服务
    pub users: Arc<ConfigUserService>,
    /// 日志守卫，必须随状态存活到进程结束
    pub log_guard: Arc<LogGuard>,
}

impl AppState {
    /// 创建应用状态
    ///
    /// peer 协议客户端与代理中继由外部协作方注入
    pub fn new(
        config: AppConfig,
        client: Arc<dyn PeerClient>,
        relay: Option<Arc<dyn AgentRelay>>,
    ) -> anyhow::Result<Self> {
        let log_guard = Arc::new(logging::init_logging(&config.log));

        config.validate()?;

        let shutdown = CancellationToken::new();

        let users = Arc::new(ConfigUserService::new(config.users.clone()));
        let ledger = Arc::new(TransferLedger::new(&config.storage.ledger_path)?);
        let cache = Arc::new(ShareCache::new(
            &config.shares,
            &config.storage,
            shutdown.clone(),
        )?);
        let queue = Arc::new(UploadQueue::new(
            &config.uploads,
            users.clone() as Arc<dyn UserService>,
        ));
        let governor = Arc::new(UploadGovernor::new(
            &config.uploads,
            users.clone() as Arc<dyn UserService>,
            shutdown.clone(),
        ));
        let uploads = Arc::new(UploadService::new(
            client,
            cache.clone(),
            ledger.clone(),
            queue.clone(),
            governor.clone(),
            relay,
            shutdown.clone(),
        ));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            shutdown,
            cache,
            ledger,
            queue,
            governor,
            uploads,
            users,
            log_guard,
        })
    }

    /// 启动时加载已有共享索引
    ///
    /// 返回是否成功加载；失败时等待首次扫描
    pub fn load_initial_cache(&self) -> anyhow::Result<bool> {
        self.cache.try_load()
    }

    /// 应用上传配置变更
    ///
    /// 队列与限速器各自做指纹比对，未变化的部分不重建
    pub async fn apply_upload_options(&self, options: UploadOptions) {
        self.queue.configure(&options).await;
        self.governor.configure(&options);

        let mut config = self.config.write().await;
        config.uploads = options;
        info!("上传配置已应用");
    }

    /// 进程关闭：取消所有传输与进行中的扫描
    pub fn shutdown(&self) {
        info!("开始关闭：取消所有活跃传输与扫描");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerError, UploadDelegate, UploadRequest, UploadSnapshot};
    use async_trait::async_trait;

    struct IdlePeerClient;

    #[async_trait]
    impl PeerClient for IdlePeerClient {
        async fn upload(
            &self,
            _request: UploadRequest,
            _delegate: Arc<dyn UploadDelegate>,
            ct: CancellationToken,
        ) -> Result<UploadSnapshot, PeerError> {
            ct.cancelled().await;
            Err(PeerError::Cancelled("关闭".to_string()))
        }
    }

    fn test_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.ledger_path = dir.join("transfers.db");
        config.storage.cache_path = dir.join("shares.db");
        config.storage.cache_backup_path = dir.join("shares.backup.db");
        config.log.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_state_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path()), Arc::new(IdlePeerClient), None).unwrap();

        // 空库首次加载
        assert!(!state.load_initial_cache().unwrap());
        assert_eq!(state.uploads.active_count(), 0);
        assert_eq!(state.queue.total_used_slots().await, 0);
    }

    #[tokio::test]
    async fn test_apply_upload_options() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path()), Arc::new(IdlePeerClient), None).unwrap();

        let mut options = UploadOptions::default();
        options.global_slots = 3;
        options.groups.default.slots = 2;
        state.apply_upload_options(options).await;

        assert_eq!(state.config.read().await.uploads.global_slots, 3);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_master_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path()), Arc::new(IdlePeerClient), None).unwrap();

        assert!(!state.shutdown.is_cancelled());
        state.shutdown();
        assert!(state.shutdown.is_cancelled());
    }
}
