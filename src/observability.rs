//! Observability setup for the LLM orchestrator.
//!
//! Configures structured logging and a Prometheus metrics endpoint, plus the domain-specific
//! counters/gauges the rest of the crate records against.

use actix_web_prom::{PrometheusMetrics, PrometheusMetricsBuilder};
use anyhow::{Context, Result};
use prometheus::{Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, ObservabilityConfig};

/// Domain metrics recorded by the cache, proxy, and balancer. Held behind `web::Data` and
/// cloned cheaply (every field is an `Arc`-backed prometheus handle).
#[derive(Clone)]
pub struct Metrics {
    pub resident_models: Gauge,
    pub load_duration_seconds: Histogram,
    pub load_total: IntCounterVec,
    pub warm_bytes_total: Gauge,
    pub backend_latency_ms: GaugeVec,
    pub backend_error_streak: GaugeVec,
    pub proxy_retry_attempts: Histogram,
}

impl Metrics {
    fn register(registry: &prometheus::Registry) -> Result<Self> {
        let resident_models = Gauge::new(
            "orchd_resident_models",
            "Number of worker processes currently resident in the cache",
        )?;
        let load_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "orchd_load_duration_seconds",
            "Time from getOrLoad start to ready, per load",
        ))?;
        let load_total = IntCounterVec::new(
            Opts::new("orchd_load_total", "Completed loads, labeled by outcome"),
            &["outcome"],
        )?;
        let warm_bytes_total = Gauge::new(
            "orchd_warm_bytes_total",
            "Total bytes read by the page-cache warmer across all models",
        )?;
        let backend_latency_ms = GaugeVec::new(
            Opts::new("orchd_backend_latency_ms", "EMA latency per load-balancer backend"),
            &["backend_id"],
        )?;
        let backend_error_streak = GaugeVec::new(
            Opts::new("orchd_backend_error_streak", "Consecutive health-check failures per backend"),
            &["backend_id"],
        )?;
        let proxy_retry_attempts = Histogram::with_opts(HistogramOpts::new(
            "orchd_proxy_retry_attempts",
            "Number of 503 retry attempts before a proxy call resolved",
        ))?;

        registry.register(Box::new(resident_models.clone()))?;
        registry.register(Box::new(load_duration_seconds.clone()))?;
        registry.register(Box::new(load_total.clone()))?;
        registry.register(Box::new(warm_bytes_total.clone()))?;
        registry.register(Box::new(backend_latency_ms.clone()))?;
        registry.register(Box::new(backend_error_streak.clone()))?;
        registry.register(Box::new(proxy_retry_attempts.clone()))?;

        Ok(Self {
            resident_models,
            load_duration_seconds,
            load_total,
            warm_bytes_total,
            backend_latency_ms,
            backend_error_streak,
            proxy_retry_attempts,
        })
    }
}

/// Initialize tracing and Prometheus metrics, returning the middleware and the metrics handle
/// to register in `App::app_data`.
pub fn init_observability(config: &ObservabilityConfig) -> Result<(PrometheusMetrics, Metrics)> {
    init_tracing(config)?;

    let endpoints_to_exclude = [
        "/health/live",
        "/health/ready",
        "/metrics",
        "/swagger-ui",
    ];

    let prometheus = PrometheusMetricsBuilder::new(&config.service_name)
        .endpoint("/metrics")
        .exclude_regex(endpoints_to_exclude.join("|"))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build prometheus middleware: {e}"))?;

    let metrics = Metrics::register(&prometheus.registry)
        .context("failed to register orchestrator metrics")?;

    Ok((prometheus, metrics))
}

fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Pretty => subscriber.pretty().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
