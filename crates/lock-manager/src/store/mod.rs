//! 协调存储抽象
//!
//! 锁管理器只依赖这里定义的原子原语：条件设置、按值比较后删除/续期、
//! 以及 EXISTS / GET / TTL / PING。生产环境使用 [`RedisStore`]，
//! 单进程部署与测试使用 [`MemoryStore`]。

mod memory_store;
mod redis_store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// key 的剩余存活时间，对应 Redis TTL 命令的三种返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// key 不存在（TTL 返回 -2）
    Missing,
    /// key 存在但没有过期时间（TTL 返回 -1）
    Persistent,
    /// 剩余存活秒数
    Expires(Duration),
}

impl KeyTtl {
    pub fn from_redis_reply(reply: i64) -> Self {
        match reply {
            -2 => Self::Missing,
            r if r < 0 => Self::Persistent,
            secs => Self::Expires(Duration::from_secs(secs as u64)),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// 协调存储接口
///
/// 连接生命周期由 `connect` / `disconnect` 管理；未连接时其余操作返回
/// [`StoreError::NotConnected`]。实现必须允许多个任务并发调用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 建立（或重建）连接
    async fn connect(&self) -> StoreResult<()>;

    /// 关闭连接
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// 往返探测
    async fn ping(&self) -> StoreResult<()>;

    /// `SET key value NX EX ttl_secs`，返回是否设置成功
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// 原子执行 `GET(key) == expected ? DEL(key) : 0`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// 原子执行 `GET(key) == expected ? EXPIRE(key, ttl_secs) : 0`
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl_secs: u64)
    -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_from_redis_reply() {
        assert_eq!(KeyTtl::from_redis_reply(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_redis_reply(-1), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_redis_reply(10),
            KeyTtl::Expires(Duration::from_secs(10))
        );
        assert_eq!(KeyTtl::from_redis_reply(0).remaining(), Some(Duration::ZERO));
        assert_eq!(KeyTtl::Persistent.remaining(), None);
    }
}
