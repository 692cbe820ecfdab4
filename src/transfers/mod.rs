//! 传输模块
//!
//! 上传控制平面：台账、槽位队列、限速与单传输生命周期编排

pub mod governor;
pub mod ledger;
pub mod queue;
pub mod service;
pub mod task;

pub use governor::UploadGovernor;
pub use ledger::{TransferLedger, TransferListFilter};
pub use queue::{QueueError, UploadQueue};
pub use service::{EnqueueError, TransferError, UploadService};
pub use task::{Transfer, TransferDirection, TransferStates};
