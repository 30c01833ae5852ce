//! Prometheus metrics HTTP endpoint
//!
//! Exposes fleet-admin metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{
    LatencySummary, Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a gauge metric with f64 value
fn write_gauge_f64(output: &mut String, name: &str, help: &str, site: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val:.6}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(output: &mut String, name: &str, help: &str, site: &str, lat: &LatencySummary) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += lat.buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += lat.buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let sum = lat.avg_us * lat.count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {}", lat.count);
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_cache_metrics(&mut output, site_id, &summary);
    write_mutation_metrics(&mut output, site_id, &summary);
    write_import_metrics(&mut output, site_id, &summary);

    output
}

fn write_cache_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "fleet_cache_updates_total",
        "Snapshots applied by the change-stream cache",
        MetricType::Counter,
        site,
        summary.cache_updates_total,
    );
    write_metric(
        output,
        "fleet_cache_notifications_total",
        "Observer callbacks invoked",
        MetricType::Counter,
        site,
        summary.observer_notifications_total,
    );
    write_metric(
        output,
        "fleet_cache_observer_panics_total",
        "Observer callbacks that panicked",
        MetricType::Counter,
        site,
        summary.observer_panics_total,
    );
    write_metric(
        output,
        "fleet_cache_stream_errors_total",
        "Change-feed errors and disconnects",
        MetricType::Counter,
        site,
        summary.stream_errors_total,
    );
    write_metric(
        output,
        "fleet_cache_reconnects_total",
        "Change-feed reconnect attempts",
        MetricType::Counter,
        site,
        summary.reconnects_total,
    );
}

fn write_mutation_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "fleet_mutation_commits_total",
        "Stop-list transactions committed",
        MetricType::Counter,
        site,
        summary.mutation_commits_total,
    );
    write_metric(
        output,
        "fleet_mutation_conflict_retries_total",
        "Version mismatches retried",
        MetricType::Counter,
        site,
        summary.conflict_retries_total,
    );
    write_metric(
        output,
        "fleet_mutation_conflicts_total",
        "Transactions abandoned after max attempts",
        MetricType::Counter,
        site,
        summary.conflicts_total,
    );
    write_metric(
        output,
        "fleet_mutation_failures_total",
        "Transactions failed for other reasons",
        MetricType::Counter,
        site,
        summary.mutation_failures_total,
    );
    write_histogram(
        output,
        "fleet_mutation_latency_us",
        "Stop-list transaction latency including retries",
        site,
        &summary.mutation,
    );
    write_metric(
        output,
        "fleet_mutation_latency_p99_us",
        "99th percentile transaction latency",
        MetricType::Gauge,
        site,
        summary.mutation.p99_us,
    );
}

fn write_import_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "fleet_import_succeeded_total",
        "Import rows committed",
        MetricType::Counter,
        site,
        summary.import_succeeded_total,
    );
    write_metric(
        output,
        "fleet_import_failed_total",
        "Import rows failed",
        MetricType::Counter,
        site,
        summary.import_failed_total,
    );
    write_gauge_f64(
        output,
        "fleet_import_rows_per_sec",
        "Import rows processed per second since last scrape",
        site,
        summary.import_rows_per_sec,
    );
    write_histogram(
        output,
        "fleet_identity_latency_us",
        "Identity provisioning call latency",
        site,
        &summary.identity,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
