//! 锁服务错误类型
//!
//! 协调存储层的错误（连接、命令、超时）与锁语义层的错误分开定义。
//! 锁争用和 token 不匹配都不是错误，它们以 `None` / `false` 返回。

use thiserror::Error;

/// 协调存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("协调存储未连接")]
    NotConnected,

    #[error("协调存储连接超时: {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("协调存储命令超时: {operation} ({timeout_ms}ms)")]
    CommandTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("协调存储不可用: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Redis(_) => "REDIS_ERROR",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            Self::CommandTimeout { .. } => "COMMAND_TIMEOUT",
            Self::Unavailable(_) => "STORE_UNAVAILABLE",
        }
    }

    /// 是否为瞬时故障（下一次尝试可能成功）
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::NotConnected
            | Self::ConnectTimeout { .. }
            | Self::CommandTimeout { .. }
            | Self::Unavailable(_) => true,
        }
    }
}

/// 锁服务错误
#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("获取锁失败: {lock_name}（已尝试 {attempts} 次）")]
    AcquireFailed { lock_name: String, attempts: u32 },
}

impl LockError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.code(),
            Self::AcquireFailed { .. } => "LOCK_ACQUIRE_FAILED",
        }
    }
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockError::AcquireFailed {
            lock_name: "job-1".to_string(),
            attempts: 3,
        };
        assert_eq!(err.to_string(), "获取锁失败: job-1（已尝试 3 次）");
        assert_eq!(err.code(), "LOCK_ACQUIRE_FAILED");

        let timeout = StoreError::CommandTimeout {
            operation: "SET",
            timeout_ms: 200,
        };
        assert_eq!(timeout.to_string(), "协调存储命令超时: SET (200ms)");
    }

    #[test]
    fn test_store_error_passes_through() {
        let err: LockError = StoreError::NotConnected.into();
        assert_eq!(err.code(), "NOT_CONNECTED");
        assert_eq!(err.to_string(), "协调存储未连接");
    }

    #[test]
    fn test_is_retryable() {
        assert!(StoreError::NotConnected.is_retryable());
        assert!(StoreError::ConnectTimeout { timeout_ms: 10 }.is_retryable());
        assert!(StoreError::Unavailable("maintenance".to_string()).is_retryable());
    }
}
