//! 分布式锁服务进程
//!
//! 加载配置、初始化可观测性并连接 Redis，随后等待退出信号；
//! 退出前释放本实例持有的全部锁并断开连接。

use anyhow::Result;
use onex_lock::{LockConfig, LockManager};
use onex_shared::{config::AppConfig, observability};
use tokio::signal;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "onex-lock";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置：config/{service_name}.toml + ONEX_ 环境变量
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    // 2. 初始化可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        key_prefix = %config.lock.key_prefix,
        "Starting {}...",
        SERVICE_NAME
    );

    // 3. 创建锁管理器并验证 Redis 连接
    let manager = LockManager::redis(&config.redis, LockConfig::from(&config.lock))?;
    manager.connect().await?;
    info!(instance_id = %manager.instance_id(), "Lock manager ready");

    shutdown_signal().await;

    // 4. 释放残留的锁，避免其他实例等待完整租约
    let summary = manager.release_all().await;
    if summary.failed > 0 {
        warn!(
            failed = summary.failed,
            "Some locks could not be released and will expire via TTL"
        );
    }
    manager.disconnect().await;

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
