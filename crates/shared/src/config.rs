//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::observability::ObservabilityConfig;

/// Redis（协调存储）配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 建立连接的超时时间
    pub connect_timeout_ms: u64,
    /// 单条命令（含 Lua 脚本）的超时时间
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 2_000,
        }
    }
}

/// 分布式锁配置节
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// 锁 key 的命名空间前缀，与同一 Redis 中的其他数据隔离
    pub key_prefix: String,
    /// 指标中的 component 标签
    pub component: String,
    pub default_lease_secs: u64,
    pub max_attempts: u32,
    pub retry_interval_ms: u64,
    /// 重试间隔上叠加的随机抖动上限，0 表示固定间隔
    pub retry_jitter_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            key_prefix: "onex:lock:".to_string(),
            component: "distributed_lock".to_string(),
            default_lease_secs: 30,
            max_attempts: 3,
            retry_interval_ms: 100,
            retry_jitter_ms: 0,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub lock: LockSettings,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "onex-lock".to_string(),
            environment: "development".to_string(),
            redis: RedisConfig::default(),
            lock: LockSettings::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 配置目录由 `CONFIG_DIR` 指定，默认为 `config`。
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from(Path::new(&config_dir), service_name)
    }

    /// 从指定目录加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. {dir}/default.toml（默认配置）
    /// 2. {dir}/{environment}.toml（环境特定配置）
    /// 3. {dir}/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（ONEX_ 前缀，层级用双下划线，如 ONEX_REDIS__URL -> redis.url）
    pub fn load_from(config_dir: &Path, service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("ONEX_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("ONEX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
