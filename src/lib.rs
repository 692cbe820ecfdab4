// Soulseek Daemon Core
// Soulseek 文件共享守护进程上传编排核心库

// 配置管理模块
pub mod config;

// 日志系统模块
pub mod logging;

// 共享文件索引模块
pub mod shares;

// 传输模块（台账、队列、限速、上传服务）
pub mod transfers;

// peer 协议库接入层
pub mod peer;

// 代理节点中继接入层
pub mod relay;

// 用户服务接入层
pub mod users;

// 应用状态组装
pub mod state;

// 导出常用类型
pub use config::{AppConfig, GroupConfig, QueueStrategy, ShareConfig, UploadOptions};
pub use logging::{init_logging, LogGuard};
pub use peer::{PeerClient, PeerError, UploadDelegate, UploadRequest, UploadSnapshot};
pub use relay::AgentRelay;
pub use shares::{SearchQuery, ShareCache, ShareCacheState, ShareError};
pub use state::AppState;
pub use transfers::{
    Transfer, TransferLedger, TransferListFilter, TransferStates, UploadGovernor, UploadQueue,
    UploadService,
};
pub use users::{ConfigUserService, UserService};
