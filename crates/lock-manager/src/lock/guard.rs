//! 作用域锁
//!
//! `LockGuard` 持有一次成功获取的锁，`with_lock` 在其上包装临界区，
//! 保证无论临界区如何结束（正常返回、返回错误、panic、被取消），
//! 都会记录持有时长并恰好尝试释放一次。

use futures::FutureExt;
use onex_shared::observability::metrics;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::lock_manager::{AcquireOptions, LockManager};
use super::token::LockToken;
use crate::error::{LockError, Result};

/// 锁守卫
///
/// 推荐显式调用 [`release`](Self::release)。守卫在未释放时被 drop
/// （例如所在任务被取消），会在当前 Tokio runtime 上调度一次释放；
/// 没有 runtime 时只能依赖 TTL 过期。
pub struct LockGuard {
    manager: LockManager,
    lock_name: String,
    token: LockToken,
    acquired_at: Instant,
    /// 释放已完成，drop 时无需再调度释放
    released: bool,
    /// 持有时长已记录，保证每次获取只记录一次
    hold_recorded: bool,
}

impl LockGuard {
    fn new(manager: LockManager, lock_name: String, token: LockToken) -> Self {
        Self {
            manager,
            lock_name,
            token,
            acquired_at: Instant::now(),
            released: false,
            hold_recorded: false,
        }
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// 自获取以来经过的时间
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// 把租约重置为从现在起的 `additional`
    pub async fn extend(&self, additional: Duration) -> bool {
        self.manager
            .extend(&self.lock_name, &self.token, additional)
            .await
    }

    /// 显式释放锁，返回存储端是否确实删除了该锁
    ///
    /// 释放完成前被取消时，drop 会重新调度释放。
    pub async fn release(mut self) -> bool {
        self.record_hold();
        let released = self.manager.release(&self.lock_name, &self.token).await;
        self.released = true;
        released
    }

    fn record_hold(&mut self) {
        if self.hold_recorded {
            return;
        }
        self.hold_recorded = true;
        metrics::record_lock_hold_duration(&self.lock_name, self.held_for().as_secs_f64());
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_name", &self.lock_name)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.record_hold();
        if self.released {
            return;
        }
        self.released = true;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(lock_name = %self.lock_name, "LockGuard dropped, scheduling release");
                let manager = self.manager.clone();
                let lock_name = std::mem::take(&mut self.lock_name);
                let token = self.token.clone();
                handle.spawn(async move {
                    manager.release(&lock_name, &token).await;
                });
            }
            Err(_) => {
                // 没有 runtime 无法执行异步释放，锁最终会通过 TTL 过期
                warn!(
                    lock_name = %self.lock_name,
                    token = %self.token,
                    "LockGuard dropped outside a runtime - lock will expire via TTL"
                );
            }
        }
    }
}

impl LockManager {
    /// 获取锁并返回守卫
    ///
    /// 用尽重试次数仍未获取到锁时返回 [`LockError::AcquireFailed`]。
    pub async fn lock(&self, lock_name: &str, options: AcquireOptions) -> Result<LockGuard> {
        match self.acquire(lock_name, options).await {
            Some(token) => Ok(LockGuard::new(self.clone(), lock_name.to_string(), token)),
            None => Err(LockError::AcquireFailed {
                lock_name: lock_name.to_string(),
                attempts: options.max_attempts,
            }),
        }
    }

    /// 在锁保护下执行临界区
    ///
    /// `body` 拿到本次获取的 token。临界区 panic 时先释放锁再继续 panic；
    /// 外层 future 被取消时由守卫的 drop 调度释放。
    #[instrument(skip(self, options, body), fields(instance_id = %self.instance_id()))]
    pub async fn with_lock<F, Fut, T>(
        &self,
        lock_name: &str,
        options: AcquireOptions,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(lock_name, options).await?;
        let outcome = AssertUnwindSafe(body(guard.token().clone()))
            .catch_unwind()
            .await;
        guard.release().await;

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, KeyTtl, MemoryStore, StoreResult};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// 按值删除前先等待 `delay` 的存储
    struct SlowReleaseStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl CoordinationStore for SlowReleaseStore {
        async fn connect(&self) -> StoreResult<()> {
            self.inner.connect().await
        }

        async fn disconnect(&self) {
            self.inner.disconnect().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }

        async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
            self.inner.set_if_absent(key, value, ttl_secs).await
        }

        async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
            tokio::time::sleep(self.delay).await;
            self.inner.delete_if_equals(key, expected).await
        }

        async fn expire_if_equals(
            &self,
            key: &str,
            expected: &str,
            ttl_secs: u64,
        ) -> StoreResult<bool> {
            self.inner.expire_if_equals(key, expected, ttl_secs).await
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
            self.inner.ttl(key).await
        }
    }

    async fn manager() -> LockManager {
        let manager = LockManager::with_defaults(Arc::new(MemoryStore::new()));
        manager.connect().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_guard_release_removes_lock() {
        let manager = manager().await;
        let guard = manager
            .lock("job-1", AcquireOptions::new(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(guard.lock_name(), "job-1");
        assert!(manager.is_locked("job-1").await);
        assert!(guard.release().await);
        assert!(!manager.is_locked("job-1").await);
        assert!(!manager.is_held_locally("job-1"));
    }

    #[tokio::test]
    async fn test_lock_fails_when_held() {
        let manager = manager().await;
        let _guard = manager
            .lock("job-1", AcquireOptions::new(Duration::from_secs(5)))
            .await
            .unwrap();

        let options = AcquireOptions::new(Duration::from_secs(5))
            .with_max_attempts(2)
            .with_retry_interval(Duration::from_millis(1));
        let err = manager.lock("job-1", options).await.unwrap_err();
        assert!(matches!(
            err,
            LockError::AcquireFailed { ref lock_name, attempts: 2 } if lock_name == "job-1"
        ));
    }

    #[tokio::test]
    async fn test_dropped_guard_schedules_release() {
        let manager = manager().await;
        let guard = manager
            .lock("job-1", AcquireOptions::new(Duration::from_secs(5)))
            .await
            .unwrap();
        drop(guard);

        // 让调度出去的释放任务运行
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!manager.is_locked("job-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cancelled_midway_is_rescheduled_by_drop() {
        let store = Arc::new(SlowReleaseStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(50),
        });
        let manager = LockManager::with_defaults(store);
        manager.connect().await.unwrap();

        let guard = manager
            .lock("job-1", AcquireOptions::new(Duration::from_secs(5)))
            .await
            .unwrap();

        // 释放进行到一半时被取消
        let cancelled = tokio::time::timeout(Duration::from_millis(10), guard.release()).await;
        assert!(cancelled.is_err());
        assert!(manager.is_locked("job-1").await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_locked("job-1").await);
    }

    #[test]
    fn test_guard_debug_lists_lock_and_token() {
        let manager = LockManager::with_defaults(Arc::new(MemoryStore::new()));
        let guard = LockGuard::new(manager, "job-1".to_string(), LockToken::from("a:b"));
        let rendered = format!("{:?}", guard);

        assert!(rendered.contains("job-1"));
        assert!(rendered.contains("a:b"));
        assert!(rendered.contains("released: false"));
        // 没有 runtime 时 drop 只记录警告
        drop(guard);
    }

    #[tokio::test]
    async fn test_guard_extend_requires_ownership() {
        let manager = manager().await;
        let guard = manager
            .lock("job-1", AcquireOptions::new(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(guard.extend(Duration::from_secs(10)).await);
        assert!(guard.release().await);
    }
}
