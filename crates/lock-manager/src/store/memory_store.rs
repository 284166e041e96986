//! 进程内协调存储
//!
//! 用一个受 Mutex 保护的 HashMap 模拟 Redis 的 key/value + TTL 语义。
//! 过期采用惰性检查：每次访问 key 时判断是否已过期。
//! 多个 [`LockManager`](crate::LockManager) 共享同一个 `Arc<MemoryStore>`
//! 即可模拟多个进程竞争同一把锁。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::{CoordinationStore, KeyTtl, StoreResult};
use crate::error::StoreError;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 过期时刻；超出时钟可表示范围时视为永不过期
fn deadline(now: Instant, ttl_secs: u64) -> Option<Instant> {
    now.checked_add(Duration::from_secs(ttl_secs))
}

/// 内存协调存储
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    connected: AtomicBool,
    /// 接下来需要注入失败的操作次数
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `count` 次数据操作返回 [`StoreError::Unavailable`]
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// 当前未过期的 key 数量
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> StoreResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    /// 在持锁状态下读取 key，顺带清理已过期的记录
    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect(&self) -> StoreResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(now, ttl_secs),
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let matches = Self::live_entry(&mut entries, key, now).is_some_and(|e| e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                // 与 EXPIRE 相同：从现在起重新计时，而不是在剩余时间上累加
                entry.expires_at = deadline(now, ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, key, now).is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, key, now).map(|e| e.value.clone()))
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let ttl = match Self::live_entry(&mut entries, key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => {
                // Redis 的 TTL 按毫秒四舍五入到秒
                let remaining_ms = at.saturating_duration_since(now).as_millis() as u64;
                KeyTtl::Expires(Duration::from_secs((remaining_ms + 500) / 1000))
            }
        };
        Ok(ttl)
    }
}
