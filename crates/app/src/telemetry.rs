use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

use landing_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

const COUNTERS: &[(&str, &str)] = &[
    (
        "email_capture_requests_total",
        "Email capture requests, labelled by outcome",
    ),
    (
        "rate_limited_total",
        "Requests rejected by the rate limiter, labelled by route",
    ),
    (
        "analytics_write_failures_total",
        "Analytics events that could not be persisted",
    ),
    (
        "analytics_ttl_deleted_total",
        "Analytics events removed by the retention sweep",
    ),
    (
        "db_busy_total",
        "SQLite busy conditions hit by maintenance, labelled by operation",
    ),
];

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL: Mutex<()> = Mutex::new(());
static START_TIME: OnceLock<Instant> = OnceLock::new();

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Pretty human-readable output for development and tests, JSON lines in
/// production. Both stamp events with RFC 3339 UTC times.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let base = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.environment {
        Environment::Development | Environment::Test => Box::new(base.pretty()),
        Environment::Production => Box::new(base.json()),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()?;

    tracing::info!(stage = "app", env = %config.environment.as_str(), version = BUILD_VERSION, git_sha = build_git_sha(), "tracing initialized");
    Ok(())
}

/// Installs the process-wide Prometheus recorder once; later calls hand
/// back the same handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let _install = match METRICS_INSTALL.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    for (name, help) in COUNTERS {
        describe_counter!(*name, *help);
    }
    describe_histogram!(
        "email_capture_latency_seconds",
        "Seconds taken to answer email capture requests"
    );
    START_TIME.get_or_init(Instant::now);
    METRICS_HANDLE.get_or_init(|| handle.clone());

    Ok(handle)
}

/// Recorder output plus the build-info and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    let _ = write!(
        body,
        "# TYPE app_build_info gauge\n\
         app_build_info{{version=\"{BUILD_VERSION}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {uptime}\n",
        build_git_sha()
    );
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;

    #[test]
    fn recorder_installs_once_and_renders_gauges() {
        let first = init_metrics().expect("metrics init");
        let second = init_metrics().expect("metrics reinit");
        counter!("analytics_write_failures_total").increment(1);

        let body = render_metrics(&second);
        assert!(body.contains("analytics_write_failures_total"));
        assert!(body.contains(&format!("app_build_info{{version=\"{BUILD_VERSION}\"")));
        assert!(body.contains("app_uptime_seconds "));
        assert!(render_metrics(&first).contains("analytics_write_failures_total"));
    }
}
