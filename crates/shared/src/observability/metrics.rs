//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
///
/// drop 时终止指标 HTTP 服务器任务。
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_lock_metrics();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册锁相关指标的描述，出现在 /metrics 的 HELP 注释中
fn register_lock_metrics() {
    metrics::describe_counter!(
        "locks_acquired_total",
        "Total number of successfully acquired distributed locks"
    );
    metrics::describe_counter!(
        "locks_failed_total",
        "Total number of failed lock acquisition attempts, by reason"
    );
    metrics::describe_gauge!(
        "locks_active",
        "Whether this instance currently holds the lock (1) or not (0)"
    );
    metrics::describe_histogram!(
        "lock_hold_duration_seconds",
        "Time a scoped lock was held, in seconds"
    );
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 锁指标记录函数
// ============================================================================

/// 锁获取失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailureReason {
    /// 某次尝试中协调存储报错
    Exception,
    /// 所有尝试用尽仍未获取到锁
    Timeout,
}

impl LockFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exception => "exception",
            Self::Timeout => "timeout",
        }
    }
}

/// 记录锁获取成功
#[inline]
pub fn record_lock_acquired(lock_name: &str, component: &str) {
    metrics::counter!(
        "locks_acquired_total",
        "lock_name" => lock_name.to_string(),
        "component" => component.to_string()
    )
    .increment(1);
}

/// 记录锁获取失败
#[inline]
pub fn record_lock_failed(lock_name: &str, component: &str, reason: LockFailureReason) {
    metrics::counter!(
        "locks_failed_total",
        "lock_name" => lock_name.to_string(),
        "component" => component.to_string(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// 更新持有状态
#[inline]
pub fn set_lock_active(lock_name: &str, holder: &str, active: bool) {
    metrics::gauge!(
        "locks_active",
        "lock_name" => lock_name.to_string(),
        "holder" => holder.to_string()
    )
    .set(if active { 1.0 } else { 0.0 });
}

/// 记录一次作用域锁的持有时长
#[inline]
pub fn record_lock_hold_duration(lock_name: &str, duration_secs: f64) {
    metrics::histogram!(
        "lock_hold_duration_seconds",
        "lock_name" => lock_name.to_string()
    )
    .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    /// 在局部 recorder 下执行，返回 (指标名, 标签, 值)
    fn capture(f: impl FnOnce()) -> Vec<(String, Vec<(String, String)>, DebugValue)> {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, f);

        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let labels = key
                    .key()
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (key.key().name().to_string(), labels, value)
            })
            .collect()
    }

    fn label<'a>(labels: &'a [(String, String)], name: &str) -> Option<&'a str> {
        labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_lock_counters_carry_labels() {
        let samples = capture(|| {
            record_lock_acquired("job-1", "scheduler");
            record_lock_acquired("job-1", "scheduler");
            record_lock_failed("job-1", "scheduler", LockFailureReason::Exception);
            record_lock_failed("job-1", "scheduler", LockFailureReason::Timeout);
        });

        let acquired = samples
            .iter()
            .find(|(name, _, _)| name == "locks_acquired_total")
            .unwrap();
        assert_eq!(label(&acquired.1, "lock_name"), Some("job-1"));
        assert_eq!(label(&acquired.1, "component"), Some("scheduler"));
        assert!(matches!(acquired.2, DebugValue::Counter(2)));

        let mut reasons: Vec<&str> = samples
            .iter()
            .filter(|(name, _, _)| name == "locks_failed_total")
            .map(|(_, labels, value)| {
                assert!(matches!(value, DebugValue::Counter(1)));
                label(labels, "reason").unwrap()
            })
            .collect();
        reasons.sort_unstable();
        assert_eq!(reasons, vec!["exception", "timeout"]);
    }

    #[test]
    fn test_lock_active_gauge_and_hold_histogram() {
        let samples = capture(|| {
            set_lock_active("job-1", "instance-a", true);
            set_lock_active("job-1", "instance-a", false);
            record_lock_hold_duration("job-1", 0.25);
        });

        let active = samples
            .iter()
            .find(|(name, _, _)| name == "locks_active")
            .unwrap();
        assert_eq!(label(&active.1, "holder"), Some("instance-a"));
        match &active.2 {
            DebugValue::Gauge(value) => assert_eq!(value.into_inner(), 0.0),
            other => panic!("unexpected value: {:?}", other),
        }

        let hold = samples
            .iter()
            .find(|(name, _, _)| name == "lock_hold_duration_seconds")
            .unwrap();
        assert_eq!(label(&hold.1, "lock_name"), Some("job-1"));
        match &hold.2 {
            DebugValue::Histogram(values) => {
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].into_inner(), 0.25);
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_lock_acquired("job-1", "distributed_lock");
        record_lock_failed("job-1", "distributed_lock", LockFailureReason::Exception);
        record_lock_failed("job-1", "distributed_lock", LockFailureReason::Timeout);
        set_lock_active("job-1", "instance-a", true);
        set_lock_active("job-1", "instance-a", false);
        record_lock_hold_duration("job-1", 0.25);
    }

    #[test]
    fn test_failure_reason_labels() {
        assert_eq!(LockFailureReason::Exception.as_str(), "exception");
        assert_eq!(LockFailureReason::Timeout.as_str(), "timeout");
    }
}
