//! 分布式锁管理器
//!
//! 基于单一协调存储端点实现锁获取、fencing 释放、租约续期与内省。
//! 互斥性完全由存储端的原子操作保证，本地注册表只做簿记。

use dashmap::DashMap;
use onex_shared::config::{LockSettings, RedisConfig};
use onex_shared::observability::metrics::{self, LockFailureReason};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::token::{LockToken, lock_key};
use crate::error::Result;
use crate::store::{CoordinationStore, KeyTtl, RedisStore, StoreResult};

/// 锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// key 命名空间前缀
    pub key_prefix: String,
    /// 指标中的 component 标签
    pub component: String,
    /// 默认租约时长
    pub default_lease: Duration,
    /// 默认最大尝试次数
    pub max_attempts: u32,
    /// 默认重试间隔
    pub retry_interval: Duration,
    /// 重试间隔上叠加的随机抖动上限
    pub retry_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "onex:lock:".to_string(),
            component: "distributed_lock".to_string(),
            default_lease: Duration::from_secs(30),
            max_attempts: 3,
            retry_interval: Duration::from_millis(100),
            retry_jitter: Duration::ZERO,
        }
    }
}

impl From<&LockSettings> for LockConfig {
    fn from(settings: &LockSettings) -> Self {
        Self {
            key_prefix: settings.key_prefix.clone(),
            component: settings.component.clone(),
            default_lease: Duration::from_secs(settings.default_lease_secs),
            max_attempts: settings.max_attempts,
            retry_interval: Duration::from_millis(settings.retry_interval_ms),
            retry_jitter: Duration::from_millis(settings.retry_jitter_ms),
        }
    }
}

impl LockConfig {
    /// 由本配置得到的默认获取参数
    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            lease: self.default_lease,
            max_attempts: self.max_attempts,
            retry_interval: self.retry_interval,
        }
    }
}

/// 单次获取调用的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// 租约时长，按整秒下发（不足一秒向上取整，最少 1 秒）
    pub lease: Duration,
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        LockConfig::default().acquire_options()
    }
}

impl AcquireOptions {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// 锁的当前状态（来自协调存储）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// 当前持有者的 token
    pub holder: LockToken,
    /// 剩余存活时间；key 没有过期时间时为 None
    pub ttl: Option<Duration>,
    /// 持有者 token 是否就是本实例本地记录的 token
    pub is_mine: bool,
}

/// 批量释放结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub released: usize,
    pub failed: usize,
}

/// 单次租约的上限（秒）
///
/// Redis 会拒绝换算成毫秒并加上当前时间后溢出的 EX / EXPIRE，
/// 这里取 `i64::MAX` 毫秒的一半，为当前时间留出余量。
pub const MAX_LEASE_SECS: u64 = (i64::MAX / 1000 / 2) as u64;

/// Redis EX / EXPIRE 只接受整秒
fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0));
    secs.clamp(1, MAX_LEASE_SECS)
}

/// 分布式锁管理器
///
/// 每个管理器生成一个实例 ID，用于它签发的所有 token。
/// `clone` 得到的句柄共享同一个存储连接、实例 ID 与本地注册表。
///
/// 连接策略：所有操作在未连接时都会先惰性建立连接；
/// 只有显式调用 [`connect`](Self::connect) 会把连接失败作为错误返回。
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    config: Arc<LockConfig>,
    /// 实例唯一标识，用于区分不同服务实例持有的锁
    instance_id: Arc<str>,
    /// 本实例认为自己持有的锁：lock_name -> token
    held: Arc<DashMap<String, LockToken>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            instance_id: Uuid::new_v4().to_string().into(),
            held: Arc::new(DashMap::new()),
        }
    }

    /// 使用默认配置创建锁管理器
    pub fn with_defaults(store: Arc<dyn CoordinationStore>) -> Self {
        Self::new(store, LockConfig::default())
    }

    /// 创建基于 Redis 的锁管理器（不会立即连接）
    pub fn redis(redis: &RedisConfig, config: LockConfig) -> Result<Self> {
        let store = RedisStore::new(redis)?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// 按配置得到的默认获取参数
    pub fn options(&self) -> AcquireOptions {
        self.config.acquire_options()
    }

    /// 锁名对应的存储 key
    pub fn key(&self, lock_name: &str) -> String {
        lock_key(&self.config.key_prefix, lock_name)
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    // ==================== 连接生命周期 ====================

    /// 建立连接并通过 PING 验证可达性
    ///
    /// 可重复调用，每次都会重建连接。
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn connect(&self) -> Result<()> {
        let result = async {
            self.store.connect().await?;
            self.store.ping().await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Connected to coordination store");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to coordination store");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn disconnect(&self) {
        self.store.disconnect().await;
        info!("Disconnected from coordination store");
    }

    /// 返回已连接的存储，未连接时先建立连接
    async fn connected_store(&self) -> StoreResult<&dyn CoordinationStore> {
        if !self.store.is_connected() {
            debug!("No coordination store connection, connecting lazily");
            self.store.connect().await?;
        }
        Ok(self.store.as_ref())
    }

    // ==================== 获取 ====================

    /// 获取锁
    ///
    /// 最多尝试 `max_attempts` 次 `SET NX EX`。锁被占用时等待
    /// `retry_interval`（可通过配置叠加抖动）后再试，因此全部因争用失败时
    /// 总等待约为 `max_attempts × retry_interval`。单次尝试中的存储错误会被
    /// 记录并计数，然后立即进入下一次尝试。用尽尝试次数返回 `None`，
    /// 这是锁争用的正常结果，不是错误。
    ///
    /// 固定间隔轮询在高争用下会让大量等待者同步重试（惊群），
    /// 这种场景应配置 `retry_jitter`。
    #[instrument(skip(self, options), fields(instance_id = %self.instance_id))]
    pub async fn acquire(&self, lock_name: &str, options: AcquireOptions) -> Option<LockToken> {
        let key = self.key(lock_name);
        let token = LockToken::mint(&self.instance_id);
        let lease_secs = whole_seconds(options.lease);

        for attempt in 1..=options.max_attempts {
            match self.try_set(&key, &token, lease_secs).await {
                Ok(true) => {
                    self.held.insert(lock_name.to_string(), token.clone());
                    metrics::record_lock_acquired(lock_name, &self.config.component);
                    metrics::set_lock_active(lock_name, &self.instance_id, true);
                    debug!(
                        lock_name = %lock_name,
                        token = %token,
                        attempt = attempt,
                        lease_secs = lease_secs,
                        "Lock acquired"
                    );
                    return Some(token);
                }
                Ok(false) => {
                    debug!(lock_name = %lock_name, attempt = attempt, "Lock is held by another owner");
                    tokio::time::sleep(self.retry_delay(options.retry_interval)).await;
                }
                Err(e) => {
                    error!(
                        lock_name = %lock_name,
                        attempt = attempt,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Lock acquire attempt failed"
                    );
                    metrics::record_lock_failed(
                        lock_name,
                        &self.config.component,
                        LockFailureReason::Exception,
                    );
                }
            }
        }

        metrics::record_lock_failed(lock_name, &self.config.component, LockFailureReason::Timeout);
        warn!(
            lock_name = %lock_name,
            attempts = options.max_attempts,
            "Failed to acquire lock after all attempts"
        );
        None
    }

    /// 只尝试一次，不等待
    pub async fn try_acquire(&self, lock_name: &str, lease: Duration) -> Option<LockToken> {
        self.acquire(lock_name, AcquireOptions::new(lease).with_max_attempts(1))
            .await
    }

    async fn try_set(&self, key: &str, token: &LockToken, lease_secs: u64) -> StoreResult<bool> {
        self.connected_store()
            .await?
            .set_if_absent(key, token.as_str(), lease_secs)
            .await
    }

    fn retry_delay(&self, interval: Duration) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return interval;
        }
        interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    // ==================== 释放与续期 ====================

    /// 释放锁
    ///
    /// 只有当存储中的值等于 `token` 时才删除。token 不匹配、key 不存在
    /// 或存储出错都返回 `false`，调用方需要检查返回值。
    #[instrument(skip(self, token), fields(instance_id = %self.instance_id))]
    pub async fn release(&self, lock_name: &str, token: &LockToken) -> bool {
        let key = self.key(lock_name);

        match self.try_release(&key, token).await {
            Ok(true) => {
                self.held.remove_if(lock_name, |_, held| held == token);
                metrics::set_lock_active(lock_name, &self.instance_id, false);
                debug!(lock_name = %lock_name, "Lock released");
                true
            }
            Ok(false) => {
                // 锁已经不存在或被其他客户端持有，这通常表示锁已过期
                warn!(
                    lock_name = %lock_name,
                    token = %token,
                    "Lock was already released or owned by another client"
                );
                false
            }
            Err(e) => {
                error!(lock_name = %lock_name, error = %e, "Failed to release lock");
                false
            }
        }
    }

    async fn try_release(&self, key: &str, token: &LockToken) -> StoreResult<bool> {
        self.connected_store()
            .await?
            .delete_if_equals(key, token.as_str())
            .await
    }

    /// 续期锁
    ///
    /// 把 TTL 重置为从现在起的 `additional`，而不是在剩余时间上累加。
    #[instrument(skip(self, token), fields(instance_id = %self.instance_id))]
    pub async fn extend(&self, lock_name: &str, token: &LockToken, additional: Duration) -> bool {
        let key = self.key(lock_name);
        let ttl_secs = whole_seconds(additional);

        match self.try_extend(&key, token, ttl_secs).await {
            Ok(true) => {
                debug!(lock_name = %lock_name, ttl_secs = ttl_secs, "Lock extended");
                true
            }
            Ok(false) => {
                warn!(
                    lock_name = %lock_name,
                    token = %token,
                    "Cannot extend lock: not held by this token"
                );
                false
            }
            Err(e) => {
                error!(lock_name = %lock_name, error = %e, "Failed to extend lock");
                false
            }
        }
    }

    async fn try_extend(&self, key: &str, token: &LockToken, ttl_secs: u64) -> StoreResult<bool> {
        self.connected_store()
            .await?
            .expire_if_equals(key, token.as_str(), ttl_secs)
            .await
    }

    /// 释放本实例记录的所有锁（用于关闭阶段）
    ///
    /// 对调用时刻的注册表快照逐个释放，单个失败不会中断后续释放。
    /// 释放失败的条目保留在注册表中。
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn release_all(&self) -> ReleaseSummary {
        let snapshot = self.held_locks();
        let mut summary = ReleaseSummary::default();

        for (lock_name, token) in snapshot {
            if self.release(&lock_name, &token).await {
                summary.released += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            released = summary.released,
            failed = summary.failed,
            "Released all held locks"
        );
        summary
    }

    // ==================== 内省 ====================

    /// key 是否存在，与持有者无关；存储出错时返回 false
    pub async fn is_locked(&self, lock_name: &str) -> bool {
        let key = self.key(lock_name);
        match self.try_exists(&key).await {
            Ok(exists) => exists,
            Err(e) => {
                error!(lock_name = %lock_name, error = %e, "Failed to check lock status");
                false
            }
        }
    }

    async fn try_exists(&self, key: &str) -> StoreResult<bool> {
        self.connected_store().await?.exists(key).await
    }

    /// 锁的持有者与剩余 TTL；key 不存在或存储出错时返回 None
    pub async fn lock_info(&self, lock_name: &str) -> Option<LockInfo> {
        let key = self.key(lock_name);
        match self.fetch_info(&key).await {
            Ok(Some((holder, ttl))) => {
                let is_mine = self
                    .held
                    .get(lock_name)
                    .is_some_and(|tracked| *tracked == holder);
                Some(LockInfo {
                    holder,
                    ttl: ttl.remaining(),
                    is_mine,
                })
            }
            Ok(None) => None,
            Err(e) => {
                error!(lock_name = %lock_name, error = %e, "Failed to get lock info");
                None
            }
        }
    }

    async fn fetch_info(&self, key: &str) -> StoreResult<Option<(LockToken, KeyTtl)>> {
        let store = self.connected_store().await?;
        let Some(holder) = store.get(key).await? else {
            return Ok(None);
        };
        let ttl = store.ttl(key).await?;
        // GET 与 TTL 之间 key 过期
        if ttl == KeyTtl::Missing {
            return Ok(None);
        }
        Ok(Some((LockToken::from(holder), ttl)))
    }

    /// 本地注册表快照
    pub fn held_locks(&self) -> Vec<(String, LockToken)> {
        self.held
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// 本实例是否记录持有该锁（仅为本地簿记，可能已过期）
    pub fn is_held_locally(&self, lock_name: &str) -> bool {
        self.held.contains_key(lock_name)
    }
}
