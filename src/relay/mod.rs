//! 代理节点中继接入层
//!
//! 共享可以挂在远端代理节点上，文件信息和文件流经中继获取；
//! 中继的传输实现是外部协作方，这里只定义窄接口

use async_trait::async_trait;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// 代理文件信息
#[derive(Debug, Clone, Copy)]
pub struct AgentFileInfo {
    /// 文件是否存在
    pub exists: bool,
    /// 文件长度（字节）
    pub length: u64,
}

/// 代理节点中继
#[async_trait]
pub trait AgentRelay: Send + Sync {
    /// 查询代理节点上的文件信息
    async fn get_file_info(&self, agent: &str, filename: &str) -> anyhow::Result<AgentFileInfo>;

    /// 打开代理节点上的文件流，已定位到 offset
    ///
    /// `id` 用于后续 [`try_close_file_stream`](Self::try_close_file_stream) 关联
    async fn get_file_stream(
        &self,
        agent: &str,
        filename: &str,
        offset: u64,
        id: Uuid,
    ) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// 尽力关闭代理节点上的文件流
    ///
    /// 返回是否成功通知到代理
    async fn try_close_file_stream(&self, agent: &str, id: Uuid, error: Option<String>) -> bool;
}
