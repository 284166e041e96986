//! 分布式锁服务
//!
//! 基于单一 Redis 端点的分布式互斥：fencing token、租约过期、
//! 比较后删除/续期、有界重试获取，以及关闭时的批量清理。

pub mod error;
pub mod lock;
pub mod store;

pub use error::{LockError, Result, StoreError};
pub use lock::{
    AcquireOptions, LockConfig, LockGuard, LockInfo, LockManager, LockToken, MAX_LEASE_SECS,
    ReleaseSummary,
};
pub use store::{CoordinationStore, KeyTtl, MemoryStore, RedisStore};
