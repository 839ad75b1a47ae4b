//! Prometheus metrics HTTP endpoint
//!
//! Exposes timing engine metrics in Prometheus text format at /metrics and a
//! liveness check at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
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

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Counter family with one label dimension
fn write_labeled_counter(output: &mut String, name: &str, help: &str, label: &str, values: &[(&str, u64)]) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_payload_metrics(&mut output, &summary);
    write_sprint_metrics(&mut output, &summary);
    write_notification_metrics(&mut output, &summary);

    output
}

fn write_payload_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "sprint_gate_uptime_seconds",
        "Seconds since the engine started",
        MetricType::Gauge,
        summary.uptime_secs,
    );
    write_metric(
        output,
        "sprint_gate_payloads_received_total",
        "Raw gate payloads delivered by the peripheral",
        MetricType::Counter,
        summary.payloads_received,
    );
    write_metric(
        output,
        "sprint_gate_payloads_dropped_total",
        "Payloads dropped because the engine queue was full",
        MetricType::Counter,
        summary.payloads_dropped,
    );
    write_labeled_counter(
        output,
        "sprint_gate_events_total",
        "Decoded gate events by kind",
        "kind",
        &[
            ("start", summary.events_start),
            ("end", summary.events_end),
            ("unknown", summary.events_unknown),
        ],
    );
    write_metric(
        output,
        "sprint_gate_foreign_lane_total",
        "Events filtered because they came from another lane",
        MetricType::Counter,
        summary.foreign_lane_filtered,
    );
}

fn write_sprint_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "sprint_gate_sprints_completed_total",
        "Sprints recorded",
        MetricType::Counter,
        summary.sprints_completed,
    );
    write_metric(
        output,
        "sprint_gate_sprints_rejected_total",
        "End events rejected for invalid distance or elapsed time",
        MetricType::Counter,
        summary.sprints_rejected,
    );
    write_metric(
        output,
        "sprint_gate_sessions_aborted_total",
        "Sessions discarded by auto-reset or reset",
        MetricType::Counter,
        summary.sessions_aborted,
    );
    write_metric(
        output,
        "sprint_gate_end_without_session_total",
        "End events received while idle",
        MetricType::Counter,
        summary.no_session_ends,
    );
}

fn write_notification_metrics(output: &mut String, summary: &MetricsSummary) {
    write_labeled_counter(
        output,
        "sprint_gate_notifications_total",
        "Notification outcomes",
        "outcome",
        &[
            ("sent", summary.notifications_sent),
            ("failed", summary.notifications_failed),
            ("dropped", summary.notifications_dropped),
        ],
    );
    write_histogram(
        output,
        "sprint_gate_notify_latency_ms",
        "Notification send latency in milliseconds",
        &summary.notify_latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.notify_latency_sum_ms,
    );
    write_metric(
        output,
        "sprint_gate_notify_latency_max_ms",
        "Maximum notification send latency",
        MetricType::Gauge,
        summary.notify_latency_max_ms,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response = text_response(StatusCode::OK, format_prometheus_metrics(&metrics));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
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
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
