//! Metrics/Observability (§4.C10).
//!
//! Installs the `metrics` crate's recorder via
//! `metrics-exporter-prometheus` and serves the rendered text alongside a
//! `/healthz` liveness route on an `axum` router, mirroring the reference
//! backend's web-framework choice even though this crate exposes nothing
//! beyond these two routes.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

/// Installs the process-wide Prometheus recorder. Must be called exactly
/// once before any `metrics::counter!`/`gauge!`/`histogram!` call site
/// runs, so `main` calls this before constructing `Context`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))
}

#[derive(Clone)]
struct AppState {
    handle: PrometheusHandle,
    started_at: Instant,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_seconds: u64,
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.handle.render()
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(HealthBody {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Serves `/metrics` and `/healthz` until the process exits. Returned
/// future runs for the process lifetime; callers `tokio::spawn` it.
pub async fn serve(handle: PrometheusHandle, port: u16) -> anyhow::Result<()> {
    let state = AppState {
        handle,
        started_at: Instant::now(),
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "metrics endpoint listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// `collector_running`/`collector_info` gauges (§6). The `collector_db_*`
/// pool gauges are emitted by `Storage::open`/`open_memory` themselves
/// (§4.C3), not here, since they describe the DB handle's lifecycle
/// rather than the process's.
pub fn record_startup_gauges(version: &str) {
    metrics::gauge!("collector_running").set(1.0);
    metrics::gauge!("collector_info", "version" => version.to_string()).set(1.0);
}

/// ETF freshness surface (§4.C8's `etf_freshness_check`, §6's
/// `collector_etf_*` gauges/counters).
pub fn record_etf_freshness(asset: &str, latest: chrono::DateTime<Utc>, now: chrono::DateTime<Utc>) {
    metrics::gauge!("collector_etf_latest_timestamp", "asset" => asset.to_string())
        .set(latest.timestamp() as f64);
    let staleness = (now - latest).num_seconds().max(0) as f64;
    metrics::gauge!("collector_etf_staleness_seconds", "asset" => asset.to_string()).set(staleness);
}

pub fn record_etf_unknown_product(asset: &str, product_code: &str) {
    metrics::counter!(
        "collector_etf_unknown_products_total",
        "asset" => asset.to_string(),
        "product_code" => product_code.to_string()
    )
    .increment(1);
}

/// Marks the process as shutting down (SIGINT/SIGTERM, §6 process
/// lifecycle): flips `collector_running` to 0 before exit.
pub fn record_shutdown() {
    metrics::gauge!("collector_running").set(0.0);
}

/// Convenience wrapper shared by every collection path (§6's
/// `collector_{ohlcv,trades,orderbook_snapshots}_collected_total`).
pub fn record_collected(kind: &str, exchange: &str, symbol: &str, timeframe: Option<&str>, n: u64) {
    let metric_name = format!("collector_{kind}_collected_total");
    match timeframe {
        Some(tf) => metrics::counter!(
            metric_name,
            "exchange" => exchange.to_string(),
            "symbol" => symbol.to_string(),
            "timeframe" => tf.to_string()
        )
        .increment(n),
        None => metrics::counter!(
            metric_name,
            "exchange" => exchange.to_string(),
            "symbol" => symbol.to_string()
        )
        .increment(n),
    }
}

pub fn record_db_write(table: &str, status: &str, n: u64) {
    metrics::counter!(
        "collector_db_writes_total",
        "table" => table.to_string(),
        "status" => status.to_string()
    )
    .increment(n);
}

pub fn record_consecutive_failures(exchange: &str, symbol: &str, timeframe: &str, count: u64) {
    metrics::gauge!(
        "collector_consecutive_failures",
        "exchange" => exchange.to_string(),
        "symbol" => symbol.to_string(),
        "timeframe" => timeframe.to_string()
    )
    .set(count as f64);
}

pub fn record_last_successful_collection(exchange: &str, symbol: &str, timeframe: &str, at: chrono::DateTime<Utc>) {
    metrics::gauge!(
        "collector_last_successful_collection_timestamp",
        "exchange" => exchange.to_string(),
        "symbol" => symbol.to_string(),
        "timeframe" => timeframe.to_string()
    )
    .set(at.timestamp() as f64);
}

pub fn record_backfill_tasks_pending(n: u64) {
    metrics::gauge!("collector_backfill_tasks_pending").set(n as f64);
}

pub fn record_backfill_task_completed(status: &str) {
    metrics::counter!("collector_backfill_tasks_completed_total", "status" => status.to_string())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_reports_ok_and_uptime() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let state = AppState {
            handle,
            started_at: Instant::now(),
        };
        let body = healthz_handler(State(state)).await.into_response();
        assert_eq!(body.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn record_helpers_do_not_panic() {
        // No recorder installed: metrics macros fall back to a process-wide
        // no-op recorder, so this only exercises that the label/name
        // plumbing itself doesn't panic.
        record_startup_gauges("0.1.0");
        record_collected("ohlcv", "binance", "BTCUSDT", Some("1m"), 3);
        record_db_write("ohlcv", "ok", 3);
        record_consecutive_failures("binance", "BTCUSDT", "1m", 0);
        record_backfill_tasks_pending(2);
        record_backfill_task_completed("completed");
        record_etf_unknown_product("btc", "XYZ");
        record_shutdown();
    }
}
