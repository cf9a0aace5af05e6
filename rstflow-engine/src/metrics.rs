//! Prometheus metrics for rstflow.
//!
//! This module provides:
//! - Metrics registry with dispatch and sweep counters
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::sweeper::SweepReport;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Dispatch duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];

/// Prometheus metrics for the workflow engine.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Dispatches by type and outcome (`ok` or an error code).
    pub dispatches_total: CounterVec,
    pub dispatch_duration: HistogramVec,
    /// Realized transitions by type.
    pub transitions_total: CounterVec,
    pub sweeps_total: Counter,
    pub sweep_expired_total: Counter,
    pub sweep_failures_total: Counter,
    pub registered_types: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let dispatches_total = CounterVec::new(
            Opts::new("rstflow_dispatches_total", "Total dispatches by type and outcome"),
            &["type", "outcome"],
        )?;
        registry.register(Box::new(dispatches_total.clone()))?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                "rstflow_dispatch_duration_seconds",
                "Dispatch duration in seconds by type",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["type"],
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        let transitions_total = CounterVec::new(
            Opts::new("rstflow_transitions_total", "Realized transitions by type"),
            &["type"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let sweeps_total = Counter::with_opts(Opts::new(
            "rstflow_sweeps_total",
            "Completed timeout sweeps",
        ))?;
        registry.register(Box::new(sweeps_total.clone()))?;

        let sweep_expired_total = Counter::with_opts(Opts::new(
            "rstflow_sweep_expired_total",
            "Expired instances found by sweeps",
        ))?;
        registry.register(Box::new(sweep_expired_total.clone()))?;

        let sweep_failures_total = Counter::with_opts(Opts::new(
            "rstflow_sweep_failures_total",
            "Timeout dispatches that failed during sweeps",
        ))?;
        registry.register(Box::new(sweep_failures_total.clone()))?;

        let registered_types = Gauge::with_opts(Opts::new(
            "rstflow_registered_types",
            "Number of registered workflow types",
        ))?;
        registry.register(Box::new(registered_types.clone()))?;

        Ok(Self {
            registry,
            dispatches_total,
            dispatch_duration,
            transitions_total,
            sweeps_total,
            sweep_expired_total,
            sweep_failures_total,
            registered_types,
        })
    }

    pub fn record_dispatch(
        &self,
        type_name: &str,
        outcome: &str,
        seconds: f64,
        transitions: usize,
    ) {
        self.dispatches_total
            .with_label_values(&[type_name, outcome])
            .inc();
        self.dispatch_duration
            .with_label_values(&[type_name])
            .observe(seconds);
        if transitions > 0 {
            self.transitions_total
                .with_label_values(&[type_name])
                .inc_by(transitions as f64);
        }
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.sweeps_total.inc();
        self.sweep_expired_total.inc_by(report.expired_found as f64);
        self.sweep_failures_total.inc_by(report.failed as f64);
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// Serves `/metrics` and `/health` until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.encode(),
        ),
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_dispatch("order", "ok", 0.002, 3);
        metrics.record_dispatch("order", "RECURSION_LIMIT", 0.001, 0);
        metrics.registered_types.set(2.0);
        metrics.record_sweep(&SweepReport {
            expired_found: 4,
            failed: 1,
            ..Default::default()
        });

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("rstflow_dispatches_total"));
        assert!(encoded.contains("outcome=\"RECURSION_LIMIT\""));
        assert!(encoded.contains("rstflow_dispatch_duration_seconds"));
        assert!(encoded.contains("rstflow_transitions_total{type=\"order\"} 3"));
        assert!(encoded.contains("rstflow_sweep_expired_total 4"));
        assert!(encoded.contains("rstflow_sweep_failures_total 1"));
        assert!(encoded.contains("rstflow_registered_types 2"));
    }

    #[test]
    fn test_respond_sets_headers() {
        let response = respond(StatusCode::NOT_FOUND, "text/plain", "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }
}
