use axum_prometheus::{PrometheusMetricLayer, PrometheusMetricLayerBuilder};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Environment;

/// Structured logging, per §9: JSON in production (machine-parseable for the
/// Loki collector named in the overview), pretty/compact in development.
/// `RUST_LOG` (via `EnvFilter`) still overrides the per-environment default.
pub fn init_tracing(env: Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match env {
        Environment::Production => {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        }
        Environment::Development => {
            registry.with(tracing_subscriber::fmt::layer().pretty()).init();
        }
    }
}

/// Builds the HTTP metrics layer and installs the process-global Prometheus
/// recorder it's backed by. `axum-prometheus` owns the recorder install here
/// (rather than a second `metrics-exporter-prometheus` install) so the
/// `http_requests_total`/`http_requests_duration_seconds` series it emits
/// land in the same registry as `ws_connections_active`,
/// `circuit_breaker_state` and `auth_login_attempts_total`, all rendered
/// together by the returned handle on `/metrics`.
pub fn install_metrics_recorder() -> (PrometheusMetricLayer<'static>, PrometheusHandle) {
    PrometheusMetricLayerBuilder::new()
        .with_default_metrics()
        .build_pair()
}

pub fn gauge_circuit_breaker_state(name: &'static str, state_value: u8) {
    metrics::gauge!("circuit_breaker_state", "breaker" => name).set(state_value as f64);
}

pub fn gauge_ws_connections(kind: &'static str, count: usize) {
    metrics::gauge!("ws_connections_active", "kind" => kind).set(count as f64);
}

pub fn increment_login_attempts(outcome: &'static str) {
    metrics::counter!("auth_login_attempts_total", "outcome" => outcome).increment(1);
}

pub fn increment_push_send(provider: &'static str, result: &'static str) {
    metrics::counter!("push_send_total", "provider" => provider, "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_do_not_panic_without_a_running_recorder() {
        // metrics::gauge!/counter! are no-ops when no recorder is installed,
        // so these just exercise the call sites for a compile-time check.
        gauge_circuit_breaker_state("shared_state_store", 0);
        gauge_ws_connections("chat", 3);
        increment_login_attempts("success");
        increment_push_send("mock", "success");
    }
}
