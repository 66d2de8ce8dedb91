//! 同步引擎错误分类
//!
//! 所有失败最终归入固定的几类，调度器按类别决定走兜底、降级还是终止。
//! 重复消息被抑制不是错误，由存储层的 upsert 结果枚举表达。

use thiserror::Error;

/// 引擎统一 Result 别名
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 传输通道未连接或派发失败，可走 HTTP 兜底
    #[error("传输通道不可用")]
    TransportUnavailable,

    /// 等待服务器确认超时，可走 HTTP 兜底
    #[error("等待服务器确认超时（{0} ms）")]
    AckTimeout(u64),

    /// HTTP 兜底请求失败，对该次发送是终态
    #[error("HTTP 兜底请求失败: {0}")]
    FallbackFailed(String),

    /// 本地存储不可用，操作降级为"服务端已成功、本地暂不落盘"
    #[error("本地存储不可用: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    /// 服务器返回业务错误码
    #[error("服务器错误 {code}: {message}")]
    Server { code: i32, message: String },

    /// 协议数据无法解析（JSON / gzip / 字段缺失）
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 引擎正在停机排空，不再接受新操作
    #[error("引擎正在停机，拒绝新操作")]
    Draining,
}

impl SyncError {
    /// 是否为可恢复错误（调度器可以继续走后续管线步骤）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::TransportUnavailable
                | SyncError::AckTimeout(_)
                | SyncError::StorageUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::FallbackFailed(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_ack_errors_are_recoverable() {
        assert!(SyncError::TransportUnavailable.is_recoverable());
        assert!(SyncError::AckTimeout(8000).is_recoverable());
    }

    #[test]
    fn fallback_failure_is_terminal() {
        assert!(!SyncError::FallbackFailed("connection refused".into()).is_recoverable());
        assert!(!SyncError::Server {
            code: 1004,
            message: "blocked".into()
        }
        .is_recoverable());
        assert!(!SyncError::Draining.is_recoverable());
    }
}
