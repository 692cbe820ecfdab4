//! 上传槽位队列
//!
//! 决定下一个获得上传槽位的任务：
//! - 按用户组优先级升序准入
//! - 组内按策略选择（FIFO 按入队时间 / RoundRobin 按就绪时间）
//! - 组槽位与全局槽位双重上限
//!
//! 全部状态由单个互斥保护，处理轮在同一互斥下执行

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::{QueueStrategy, UploadOptions};
use crate::users::UserService;

/// Privileged 组名（始终存在）
pub const PRIVILEGED_GROUP: &str = "privileged";
/// 默认组名
pub const DEFAULT_GROUP: &str = "default";
/// 吸血用户组名
pub const LEECHERS_GROUP: &str = "leechers";

/// 队列错误
#[derive(Debug)]
pub enum QueueError {
    /// 用户组内不存在对应条目
    EntryNotFound {
        username: String,
        filename: String,
    },
    /// 等待准入期间被取消
    Cancelled,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntryNotFound { username, filename } => {
                write!(f, "队列中不存在条目: username={}, filename={}", username, filename)
            }
            Self::Cancelled => write!(f, "等待上传槽位时被取消"),
        }
    }
}

impl std::error::Error for QueueError {}

/// 队列条目
///
/// 同一 (username, filename) 至多存在一个条目
struct QueueEntry {
    username: String,
    filename: String,
    /// 入队时间
    enqueued_at: DateTime<Utc>,
    /// 就绪时间（peer 侧到达槽位等待点）
    ready_at: Option<DateTime<Utc>>,
    /// 准入信号
    signal: Option<oneshot::Sender<()>>,
}

impl QueueEntry {
    /// 条目是否就绪（可被准入）
    fn is_ready(&self) -> bool {
        self.ready_at.is_some() && self.signal.is_some()
    }
}

/// 用户组运行态
struct UploadGroup {
    name: String,
    priority: u32,
    slots: usize,
    strategy: QueueStrategy,
    /// 已占用槽位数
    used_slots: usize,
    /// 组内排队条目
    entries: Vec<QueueEntry>,
}

/// 队列内部状态
struct QueueState {
    /// 按 (priority, name) 升序排列
    groups: Vec<UploadGroup>,
    /// 全局槽位上限
    max_slots: usize,
    /// 用户组配置指纹
    fingerprint: String,
}

impl QueueState {
    fn group_mut(&mut self, name: &str) -> Option<&mut UploadGroup> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    fn total_used_slots(&self) -> usize {
        self.groups.iter().map(|g| g.used_slots).sum()
    }

    fn contains_entry(&self, username: &str, filename: &str) -> bool {
        self.groups.iter().any(|g| {
            g.entries
                .iter()
                .any(|e| e.username == username && e.filename == filename)
        })
    }
}

/// 上传槽位队列
pub struct UploadQueue {
    state: Mutex<QueueState>,
    users: Arc<dyn UserService>,
}

impl UploadQueue {
    /// 创建上传队列
    pub fn new(options: &UploadOptions, users: Arc<dyn UserService>) -> Self {
        let groups = Self::build_groups(options);
        info!(
            "创建上传槽位队列: 全局槽位={}, 用户组={}",
            options.global_slots,
            groups.len()
        );

        Self {
            state: Mutex::new(QueueState {
                groups,
                max_slots: options.global_slots,
                fingerprint: Self::fingerprint(options),
            }),
            users,
        }
    }

    /// 根据配置构建用户组列表
    ///
    /// Privileged 组固定为优先级 0、槽位等于全局上限、轮转策略
    fn build_groups(options: &UploadOptions) -> Vec<UploadGroup> {
        let mut groups = Vec::new();

        groups.push(UploadGroup {
            name: PRIVILEGED_GROUP.to_string(),
            priority: 0,
            slots: options.global_slots,
            strategy: QueueStrategy::RoundRobin,
            used_slots: 0,
            entries: Vec::new(),
        });

        let mut push_config = |name: &str, config: &crate::config::GroupConfig| {
            groups.push(UploadGroup {
                name: name.to_string(),
                priority: config.priority,
                slots: config.slots,
                strategy: config.strategy,
                used_slots: 0,
                entries: Vec::new(),
            });
        };

        push_config(DEFAULT_GROUP, &options.groups.default);
        push_config(LEECHERS_GROUP, &options.groups.leechers);
        for (name, config) in &options.groups.user_defined {
            push_config(name, config);
        }

        groups.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        groups
    }

    /// 队列关心的配置指纹（用户组 + 全局槽位）
    fn fingerprint(options: &UploadOptions) -> String {
        let json = serde_json::to_string(&options.groups).unwrap_or_default();
        format!("{:x}:{}", md5::compute(json.as_bytes()), options.global_slots)
    }

    /// 解析用户所属组名，未映射或组不存在时回落到默认组
    async fn resolve_group(&self, username: &str) -> String {
        self.users
            .get_group(username)
            .await
            .unwrap_or_else(|| DEFAULT_GROUP.to_string())
    }

    // ========================================================================
    // 操作
    // ========================================================================

    /// 注册排队条目并触发处理
    pub async fn enqueue(&self, username: &str, filename: &str) {
        let group_name = self.resolve_group(username).await;
        let mut state = self.state.lock().await;

        // 同 (username, filename) 至多一个条目
        if state.contains_entry(username, filename) {
            debug!("条目已在队列中: username={}, filename={}", username, filename);
            return;
        }

        let group_name = if state.group_mut(&group_name).is_some() {
            group_name
        } else {
            // 映射到不存在的组时归入默认组
            DEFAULT_GROUP.to_string()
        };

        if let Some(group) = state.group_mut(&group_name) {
            group.entries.push(QueueEntry {
                username: username.to_string(),
                filename: filename.to_string(),
                enqueued_at: Utc::now(),
                ready_at: None,
                signal: None,
            });
            debug!(
                "上传入队: username={}, filename={}, group={}",
                username, filename, group_name
            );
        }

        Self::process(&mut state);
    }

    /// 标记条目就绪并返回准入信号
    ///
    /// peer 侧到达槽位等待点时调用；条目不存在时返回错误。
    /// 互斥在本方法返回时释放，返回的信号在互斥外等待
    pub async fn await_start(
        &self,
        username: &str,
        filename: &str,
    ) -> Result<oneshot::Receiver<()>, QueueError> {
        let group_name = self.resolve_group(username).await;
        let mut state = self.state.lock().await;

        let entry_missing = QueueError::EntryNotFound {
            username: username.to_string(),
            filename: filename.to_string(),
        };

        let Some(group) = state.group_mut(&group_name) else {
            return Err(entry_missing);
        };
        let Some(entry) = group
            .entries
            .iter_mut()
            .find(|e| e.username == username && e.filename == filename)
        else {
            return Err(entry_missing);
        };

        entry.ready_at = Some(Utc::now());
        let (tx, rx) = oneshot::channel();
        entry.signal = Some(tx);

        Self::process(&mut state);
        Ok(rx)
    }

    /// 上传结束，释放槽位并触发处理
    ///
    /// 同键的遗留条目（被取消的传输）一并清理；未知组为无操作
    pub async fn complete(&self, username: &str, filename: &str) {
        let group_name = self.resolve_group(username).await;
        let mut state = self.state.lock().await;

        let Some(group) = state.group_mut(&group_name) else {
            warn!("完成通知命中未知用户组，忽略: group={}", group_name);
            return;
        };

        group
            .entries
            .retain(|e| !(e.username == username && e.filename == filename));
        // 槽位计数下限为 0
        group.used_slots = group.used_slots.saturating_sub(1);

        debug!(
            "上传槽位释放: username={}, group={}, 组占用={}/{}",
            username, group_name, group.used_slots, group.slots
        );

        Self::process(&mut state);
    }

    /// 处理轮：在互斥下反复准入，直到全局槽位耗尽或没有就绪条目
    fn process(state: &mut QueueState) {
        loop {
            if state.total_used_slots() >= state.max_slots {
                return;
            }

            let mut fired = false;

            // 按优先级升序找到第一个可准入的组
            for group in state.groups.iter_mut() {
                if group.used_slots >= group.slots {
                    continue;
                }

                // 组内按策略选择条目
                let selected = match group.strategy {
                    QueueStrategy::FirstInFirstOut => group
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.is_ready())
                        .min_by_key(|(_, e)| e.enqueued_at)
                        .map(|(i, _)| i),
                    QueueStrategy::RoundRobin => group
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| e.is_ready())
                        .min_by_key(|(_, e)| e.ready_at)
                        .map(|(i, _)| i),
                };

                let Some(index) = selected else { continue };
                let entry = group.entries.swap_remove(index);

                if let Some(signal) = entry.signal {
                    if signal.send(()).is_ok() {
                        group.used_slots += 1;
                        debug!(
                            "准入上传: username={}, group={}, 组占用={}/{}",
                            entry.username, group.name, group.used_slots, group.slots
                        );
                    } else {
                        // 等待方已放弃（传输被取消），不消耗槽位
                        debug!(
                            "准入信号无人接收，丢弃条目: username={}, filename={}",
                            entry.username, entry.filename
                        );
                    }
                }
                fired = true;
                break;
            }

            if !fired {
                return;
            }
        }
    }

    /// 配置变更时重建用户组
    ///
    /// 指纹未变则直接返回；重建时按组名保留已占用槽位计数，
    /// 消失的组中的条目移入默认组
    pub async fn configure(&self, options: &UploadOptions) {
        let fingerprint = Self::fingerprint(options);
        let mut state = self.state.lock().await;

        if state.fingerprint == fingerprint {
            debug!("用户组配置未变化，跳过重建");
            return;
        }

        let mut new_groups = Self::build_groups(options);

        let mut old_used: HashMap<String, usize> = HashMap::new();
        let mut orphaned: Vec<(String, Vec<QueueEntry>)> = Vec::new();
        for old in state.groups.drain(..) {
            old_used.insert(old.name.clone(), old.used_slots);
            orphaned.push((old.name, old.entries));
        }

        for group in new_groups.iter_mut() {
            if let Some(&used) = old_used.get(&group.name) {
                group.used_slots = used;
            }
        }

        // 条目回填：同名组还在则归位，否则归入默认组
        for (old_name, entries) in orphaned {
            let target = if new_groups.iter().any(|g| g.name == old_name) {
                old_name
            } else {
                DEFAULT_GROUP.to_string()
            };
            if let Some(group) = new_groups.iter_mut().find(|g| g.name == target) {
                group.entries.extend(entries);
            }
        }

        state.groups = new_groups;
        state.max_slots = options.global_slots;
        state.fingerprint = fingerprint;

        info!(
            "🔧 上传队列已重建: 全局槽位={}, 用户组数={}",
            state.max_slots,
            state.groups.len()
        );

        Self::process(&mut state);
    }

    // ========================================================================
    // 查询（监控/测试用）
    // ========================================================================

    /// 全局已占用槽位数
    pub async fn total_used_slots(&self) -> usize {
        self.state.lock().await.total_used_slots()
    }

    /// 指定组的已占用槽位数
    pub async fn group_used_slots(&self, name: &str) -> Option<usize> {
        let mut state = self.state.lock().await;
        state.group_mut(name).map(|g| g.used_slots)
    }

    /// 排队条目总数
    pub async fn queued_count(&self) -> usize {
        let state = self.state.lock().await;
        state.groups.iter().map(|g| g.entries.len()).sum()
    }
}
