//! Redis 协调存储
//!
//! 单一 Redis 端点，使用一个 multiplexed 连接供所有并发操作共享。
//! 比较后删除/续期通过 Lua 脚本在服务端原子执行。

use async_trait::async_trait;
use onex_shared::config::RedisConfig;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{CoordinationStore, KeyTtl, StoreResult};
use crate::error::StoreError;

/// 只有当 key 的值等于调用方 token 时才删除
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// 只有当 key 的值等于调用方 token 时才把 TTL 重置为 ARGV[2] 秒
const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("expire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis 协调存储客户端
pub struct RedisStore {
    client: Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    connect_timeout: Duration,
    command_timeout: Duration,
    release_script: Script,
    extend_script: Script,
}

impl RedisStore {
    /// 创建客户端（不会立即建立连接）
    pub fn new(config: &RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    fn connection(&self) -> StoreResult<MultiplexedConnection> {
        self.conn.read().clone().ok_or(StoreError::NotConnected)
    }

    /// 为单条命令加上超时限制
    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::CommandTimeout {
                operation,
                timeout_ms: self.command_timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn connect(&self) -> StoreResult<()> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::ConnectTimeout {
            timeout_ms: self.connect_timeout.as_millis() as u64,
        })??;

        *self.conn.write() = Some(conn);
        info!("Redis connection established");
        Ok(())
    }

    async fn disconnect(&self) {
        if self.conn.write().take().is_some() {
            debug!("Redis connection dropped");
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.read().is_some()
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection()?;
        self.timed("PING", async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut conn = self.connection()?;

        // SET key value NX EX seconds
        // 成功返回 "OK"，key 已存在时返回 nil
        let result: Option<String> = self
            .timed("SET", async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(result.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let script = &self.release_script;

        let deleted: i64 = self
            .timed("EVAL release", async move {
                script.key(key).arg(expected).invoke_async(&mut conn).await
            })
            .await?;

        Ok(deleted != 0)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let script = &self.extend_script;

        let updated: i64 = self
            .timed("EVAL extend", async move {
                script
                    .key(key)
                    .arg(expected)
                    .arg(ttl_secs)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(updated != 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        self.timed("EXISTS", async move {
            redis::cmd("EXISTS").arg(key).query_async::<bool>(&mut conn).await
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection()?;
        self.timed("GET", async move {
            redis::cmd("GET")
                .arg(key)
                .query_async::<Option<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.connection()?;
        let reply: i64 = self
            .timed("TTL", async move {
                redis::cmd("TTL").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(KeyTtl::from_redis_reply(reply))
    }
}
