//! 分布式锁模块
//!
//! 基于单一 Redis 端点的分布式锁实现。
//!
//! ## 设计理念
//!
//! - **存储即真相**: 互斥性只由协调存储的条件操作保证，本地注册表只是簿记
//! - **Fencing token**: 每次获取都签发新 token，释放与续期必须出示当前 token
//! - **租约兜底**: 每条锁记录都有 TTL，崩溃的持有者最多阻塞一个租约周期
//! - **RAII 模式**: 通过 `LockGuard` / `with_lock` 确保锁在任何退出路径上被释放
//!
//! 单端点是有意的取舍：实现简单，但 Redis 本身是单点故障，这里不做
//! Redlock 式的多节点仲裁。
//!
//! ## 使用示例
//!
//! ```ignore
//! let manager = LockManager::redis(&config.redis, LockConfig::from(&config.lock))?;
//! manager.connect().await?;
//!
//! // 获取锁（争用时返回 None）
//! if let Some(token) = manager.acquire("job-1", manager.options()).await {
//!     do_critical_work().await?;
//!     manager.release("job-1", &token).await;
//! }
//!
//! // 作用域锁：获取失败返回错误，临界区结束时自动释放
//! manager
//!     .with_lock("job-1", manager.options(), |token| async move {
//!         do_critical_work_with(token).await
//!     })
//!     .await?;
//! ```

mod guard;
mod lock_manager;
mod token;

pub use guard::LockGuard;
pub use lock_manager::{
    AcquireOptions, LockConfig, LockInfo, LockManager, MAX_LEASE_SECS, ReleaseSummary,
};
pub use token::{LockToken, lock_key};
