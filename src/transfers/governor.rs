//! 上传限速器
//!
//! 按用户组划分的令牌桶：
//! - 桶容量 = 组限速 × 1024 / 10，每 100ms 回满一次（100ms 余量）
//! - 领取量可小于请求量，余额不足时挂起等待回灌
//! - 未用完的配额归还原桶，溢出部分静默丢弃
//! - 配置变更时整体重建桶表并原子换入

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::UploadOptions;
use crate::users::UserService;

use super::queue::{DEFAULT_GROUP, LEECHERS_GROUP, PRIVILEGED_GROUP};

/// 令牌桶回灌间隔
const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// 限速器错误
#[derive(Debug)]
pub enum GovernorError {
    /// 等待配额期间被取消
    Cancelled,
}

impl std::fmt::Display for GovernorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "等待发送配额时被取消"),
        }
    }
}

impl std::error::Error for GovernorError {}

/// 令牌桶
///
/// 余额始终在 [0, capacity] 区间内
#[derive(Debug)]
struct TokenBucket {
    /// 所属用户组
    name: String,
    /// 桶容量（字节）
    capacity: u64,
    /// 当前余额
    balance: Mutex<u64>,
    /// 等待回灌的通知
    notify: Notify,
}

impl TokenBucket {
    /// 按组限速创建桶，容量为 100ms 的发送余量
    fn new(name: impl Into<String>, speed_limit_kbps: u64) -> Self {
        let capacity = (speed_limit_kbps * 1024 / 10).max(1);
        Self::with_capacity(name, capacity)
    }

    fn with_capacity(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            balance: Mutex::new(capacity),
            notify: Notify::new(),
        }
    }

    /// 领取至多 `requested` 字节的配额
    ///
    /// 余额为零时挂起，直到回灌或取消；取消不消耗令牌
    async fn acquire(&self, requested: u64, ct: &CancellationToken) -> Result<u64, GovernorError> {
        loop {
            {
                let mut balance = self.balance.lock().unwrap();
                if *balance > 0 {
                    let granted = requested.min(*balance);
                    *balance -= granted;
                    return Ok(granted);
                }
            }

            tokio::select! {
                _ = ct.cancelled() => return Err(GovernorError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
    }

    /// 回灌到满容量并唤醒等待者
    fn refill(&self) {
        {
            let mut balance = self.balance.lock().unwrap();
            *balance = self.capacity;
        }
        self.notify.notify_waiters();
    }

    /// 归还未使用的配额，超出容量的部分丢弃
    fn credit(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        {
            let mut balance = self.balance.lock().unwrap();
            *balance = (*balance + amount).min(self.capacity);
        }
        self.notify.notify_waiters();
    }
}

/// 上传限速器
pub struct UploadGovernor {
    users: Arc<dyn UserService>,
    /// 组名 -> 令牌桶，整表原子换入
    buckets: Arc<RwLock<HashMap<String, Arc<TokenBucket>>>>,
    /// 配置指纹
    fingerprint: Mutex<String>,
}

impl UploadGovernor {
    /// 创建限速器并启动回灌循环
    pub fn new(
        options: &UploadOptions,
        users: Arc<dyn UserService>,
        master_token: CancellationToken,
    ) -> Self {
        let buckets = Arc::new(RwLock::new(Self::build_buckets(options)));

        info!(
            "创建上传限速器: 全局限速={}KB/s, 桶数={}",
            options.speed_limit_kbps,
            buckets.read().unwrap().len()
        );

        Self::start_refill_loop(buckets.clone(), master_token);

        Self {
            users,
            buckets,
            fingerprint: Mutex::new(options.groups_fingerprint()),
        }
    }

    /// 按配置构建桶表
    ///
    /// Privileged 桶使用全局限速，其余各组使用自身限速
    fn build_buckets(options: &UploadOptions) -> HashMap<String, Arc<TokenBucket>> {
        let mut buckets = HashMap::new();

        buckets.insert(
            PRIVILEGED_GROUP.to_string(),
            Arc::new(TokenBucket::new(PRIVILEGED_GROUP, options.speed_limit_kbps)),
        );
        buckets.insert(
            DEFAULT_GROUP.to_string(),
            Arc::new(TokenBucket::new(
                DEFAULT_GROUP,
                options.groups.default.speed_limit_kbps,
            )),
        );
        buckets.insert(
            LEECHERS_GROUP.to_string(),
            Arc::new(TokenBucket::new(
                LEECHERS_GROUP,
                options.groups.leechers.speed_limit_kbps,
            )),
        );
        for (name, config) in &options.groups.user_defined {
            buckets.insert(
                name.clone(),
                Arc::new(TokenBucket::new(name.clone(), config.speed_limit_kbps)),
            );
        }

        buckets
    }

    /// 启动全局回灌循环（100ms 周期）
    fn start_refill_loop(
        buckets: Arc<RwLock<HashMap<String, Arc<TokenBucket>>>>,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFILL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let buckets = buckets.read().unwrap();
                        for bucket in buckets.values() {
                            bucket.refill();
                        }
                    }
                }
            }

            debug!("限速器回灌循环已停止");
        });
    }

    /// 查找用户对应的桶，映射缺失时回落到默认组桶
    async fn bucket_for(&self, username: &str) -> Arc<TokenBucket> {
        let group = self
            .users
            .get_group(username)
            .await
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());

        let buckets = self.buckets.read().unwrap();
        buckets
            .get(&group)
            .or_else(|| buckets.get(DEFAULT_GROUP))
            .cloned()
            .expect("默认组桶始终存在")
    }

    /// 领取发送配额
    ///
    /// 返回的字节数可能小于请求值，调用方必须容忍部分授予
    pub async fn get_bytes(
        &self,
        username: &str,
        requested: u64,
        ct: &CancellationToken,
    ) -> Result<u64, GovernorError> {
        let bucket = self.bucket_for(username).await;
        bucket.acquire(requested, ct).await
    }

    /// 归还未使用的配额
    ///
    /// waste = granted - actual；实际用量由 peer 库内部的全局限速器决定，
    /// 这里只归还本地已知未用的部分
    pub async fn return_bytes(&self, username: &str, attempted: u64, granted: u64, actual: u64) {
        let waste = granted.saturating_sub(actual);
        if waste == 0 {
            return;
        }

        let bucket = self.bucket_for(username).await;
        bucket.credit(waste);
        debug!(
            "归还配额: username={}, group={}, attempted={}, granted={}, actual={}, waste={}",
            username, bucket.name, attempted, granted, actual, waste
        );
    }

    /// 配置变更时重建桶表
    ///
    /// 指纹未变则直接返回。重建后旧桶余额丢失、传输短暂回到满容量，
    /// 旧桶被回满以释放滞留的等待者
    pub fn configure(&self, options: &UploadOptions) {
        let fingerprint = options.groups_fingerprint();
        {
            let mut current = self.fingerprint.lock().unwrap();
            if *current == fingerprint {
                debug!("限速配置未变化，跳过重建");
                return;
            }
            *current = fingerprint;
        }

        let new_buckets = Self::build_buckets(options);
        let old_buckets = {
            let mut buckets = self.buckets.write().unwrap();
            std::mem::replace(&mut *buckets, new_buckets)
        };

        // 等待旧桶的任务需要被唤醒，否则会一直挂在不再回灌的桶上
        for bucket in old_buckets.values() {
            bucket.refill();
        }

        info!(
            "🔧 上传限速器已重建: 全局限速={}KB/s",
            options.speed_limit_kbps
        );
    }
}

impl std::fmt::Debug for UploadGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadGovernor")
            .field("buckets", &self.buckets.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::ConfigUserService;
    use std::collections::HashMap as StdHashMap;

    fn governor(options: &UploadOptions) -> UploadGovernor {
        let users = Arc::new(ConfigUserService::new(StdHashMap::new()));
        UploadGovernor::new(options, users, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_partial_grant() {
        // 容量 1000、余额 300 时请求 1000 应立即返回 300
        let bucket = TokenBucket::with_capacity("test", 1000);
        let ct = CancellationToken::new();

        assert_eq!(bucket.acquire(700, &ct).await.unwrap(), 700);
        assert_eq!(bucket.acquire(1000, &ct).await.unwrap(), 300);

        // 余额为零时挂起
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            bucket.acquire(1, &ct),
        )
        .await;
        assert!(pending.is_err(), "余额为零时应挂起");

        // 回灌后可继续领取
        bucket.refill();
        assert_eq!(bucket.acquire(400, &ct).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_cancellation_releases_waiter() {
        let bucket = Arc::new(TokenBucket::with_capacity("test", 100));
        let ct = CancellationToken::new();

        assert_eq!(bucket.acquire(100, &ct).await.unwrap(), 100);

        let waiter = {
            let bucket = bucket.clone();
            let ct = ct.clone();
            tokio::spawn(async move { bucket.acquire(10, &ct).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ct.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GovernorError::Cancelled)));

        // 取消不消耗令牌
        bucket.refill();
        assert_eq!(*bucket.balance.lock().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_credit_caps_at_capacity() {
        let bucket = TokenBucket::with_capacity("test", 100);
        let ct = CancellationToken::new();

        assert_eq!(bucket.acquire(40, &ct).await.unwrap(), 40);

        // 超额归还被丢弃
        bucket.credit(10_000);
        assert_eq!(bucket.acquire(u64::MAX, &ct).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_refill_wakes_waiter() {
        let bucket = Arc::new(TokenBucket::with_capacity("test", 100));
        let ct = CancellationToken::new();

        assert_eq!(bucket.acquire(100, &ct).await.unwrap(), 100);

        let waiter = {
            let bucket = bucket.clone();
            let ct = ct.clone();
            tokio::spawn(async move { bucket.acquire(30, &ct).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bucket.refill();

        assert_eq!(waiter.await.unwrap().unwrap(), 30);
    }

    #[tokio::test]
    async fn test_unknown_user_falls_back_to_default_bucket() {
        let gov = governor(&UploadOptions::default());
        let ct = CancellationToken::new();

        // 未映射用户走默认组桶（默认 1024KB/s -> 容量 104857）
        let granted = gov.get_bytes("stranger", 1024, &ct).await.unwrap();
        assert_eq!(granted, 1024);
    }

    #[tokio::test]
    async fn test_return_bytes_credits_waste() {
        let gov = governor(&UploadOptions::default());
        let ct = CancellationToken::new();

        let capacity = 1024 * 1024 / 10; // 默认组容量
        let granted = gov.get_bytes("u", capacity, &ct).await.unwrap();
        assert_eq!(granted, capacity);

        // 只用掉一半，归还剩余
        gov.return_bytes("u", capacity, granted, granted / 2).await;
        let regranted = gov.get_bytes("u", capacity, &ct).await.unwrap();
        assert_eq!(regranted, capacity / 2);
    }

    #[tokio::test]
    async fn test_configure_rebuilds_only_on_change() {
        let gov = governor(&UploadOptions::default());

        let before = gov.bucket_for("u").await;
        gov.configure(&UploadOptions::default());
        let unchanged = gov.bucket_for("u").await;
        assert!(Arc::ptr_eq(&before, &unchanged), "相同配置不应重建桶表");

        let mut changed = UploadOptions::default();
        changed.groups.default.speed_limit_kbps = 2048;
        gov.configure(&changed);
        let rebuilt = gov.bucket_for("u").await;
        assert!(!Arc::ptr_eq(&before, &rebuilt), "配置变更应重建桶表");
        assert_eq!(rebuilt.capacity, 2048 * 1024 / 10);
    }

    #[tokio::test]
    async fn test_refill_loop_restores_capacity() {
        let gov = governor(&UploadOptions::default());
        let ct = CancellationToken::new();

        let capacity = 1024 * 1024 / 10;
        assert_eq!(gov.get_bytes("u", capacity, &ct).await.unwrap(), capacity);

        // 排空后等待回灌循环（100ms 周期）恢复满额
        let granted = tokio::time::timeout(
            Duration::from_millis(500),
            gov.get_bytes("u", capacity, &ct),
        )
        .await
        .expect("回灌循环应在 100ms 周期内唤醒等待者")
        .unwrap();
        assert!(granted > 0);
    }
}
