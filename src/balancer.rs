//! Cross-Backend Load Balancer (C6).
//!
//! Picks among several workers capable of serving a given model, tracks per-backend health via
//! a consecutive-failure counter, and keeps request-accounting counters for each strategy.
//! Grounded on the teacher's `core/circuit_breaker.rs` state-holding shape (atomics guarded by
//! an outer `RwLock` for the rarely-mutated config/id fields), simplified from its three-state
//! Closed/Open/HalfOpen machine to the spec's binary healthy/unhealthy signal.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::BalancerStrategy;
use crate::errors::OrchestratorError;

const CONSECUTIVE_FAILURES_TO_TRIP: u32 = 3;

/// A registered inference backend. `served_models` of `["*"]` serves every model.
pub struct Backend {
    pub id: String,
    pub base_url: String,
    pub health_path: String,
    pub served_models: Vec<String>,
    pub weight: u32,
    pub max_concurrent: u32,
    enabled: AtomicBool,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    active_requests: AtomicU32,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    /// Stored as milli-units (latency_ms * 1000) so an atomic integer can hold the EMA.
    avg_latency_ms_milli: AtomicU64,
}

impl Backend {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        health_path: impl Into<String>,
        served_models: Vec<String>,
        weight: u32,
        max_concurrent: u32,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            health_path: health_path.into(),
            served_models,
            weight: weight.max(1),
            max_concurrent,
            enabled: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            active_requests: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            avg_latency_ms_milli: AtomicU64::new(0),
        }
    }

    fn serves(&self, model_id: &str) -> bool {
        self.served_models.iter().any(|m| m == "*" || m == model_id)
    }

    fn is_eligible(&self, model_id: &str) -> bool {
        self.enabled.load(Ordering::Relaxed)
            && self.healthy.load(Ordering::Relaxed)
            && self.serves(model_id)
            && (self.active_requests.load(Ordering::Relaxed) as u32) < self.max_concurrent
    }

    fn avg_latency_ms(&self) -> f64 {
        self.avg_latency_ms_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id.clone(),
            base_url: self.base_url.clone(),
            enabled: self.enabled.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub base_url: String,
    pub enabled: bool,
    pub healthy: bool,
    pub active_requests: u32,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
}

struct RoundRobinState {
    counter: AtomicU64,
}

/// The Load Balancer. Constructed once and held in `AppState`.
pub struct LoadBalancer {
    backends: RwLock<Vec<Arc<Backend>>>,
    strategy: BalancerStrategy,
    round_robin: RoundRobinState,
    health_check_interval: Duration,
    http: reqwest::Client,
}

impl LoadBalancer {
    pub fn new(strategy: BalancerStrategy, health_check_interval_ms: u64, http: reqwest::Client) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            strategy,
            round_robin: RoundRobinState { counter: AtomicU64::new(0) },
            health_check_interval: Duration::from_millis(health_check_interval_ms),
            http,
        }
    }

    pub async fn register(&self, backend: Backend) {
        let mut backends = self.backends.write().await;
        backends.push(Arc::new(backend));
    }

    pub async fn deregister(&self, id: &str) -> bool {
        let mut backends = self.backends.write().await;
        let before = backends.len();
        backends.retain(|b| b.id != id);
        backends.len() != before
    }

    pub async fn list(&self) -> Vec<BackendSnapshot> {
        self.backends.read().await.iter().map(|b| b.snapshot()).collect()
    }

    /// Filter by (enabled ∧ healthy ∧ serves modelId ∧ under max concurrency), then select by
    /// strategy (spec §4.6).
    pub async fn pick(&self, model_id: &str) -> Result<Arc<Backend>, OrchestratorError> {
        let backends = self.backends.read().await;
        let eligible: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.is_eligible(model_id)).collect();

        if eligible.is_empty() {
            return Err(OrchestratorError::ModelNotFound(model_id.to_string()));
        }

        let chosen = match self.strategy {
            BalancerStrategy::RoundRobin => {
                let idx = self.round_robin.counter.fetch_add(1, Ordering::Relaxed) as usize % eligible.len();
                eligible[idx]
            }
            BalancerStrategy::WeightedRoundRobin => {
                let total_weight: u32 = eligible.iter().map(|b| b.weight).sum();
                let mut target = self.round_robin.counter.fetch_add(1, Ordering::Relaxed) as u32 % total_weight.max(1);
                let mut selected = eligible[0];
                for backend in &eligible {
                    if target < backend.weight {
                        selected = backend;
                        break;
                    }
                    target -= backend.weight;
                }
                selected
            }
            BalancerStrategy::LeastConnections => eligible
                .iter()
                .min_by_key(|b| b.active_requests.load(Ordering::Relaxed))
                .copied()
                .unwrap(),
            BalancerStrategy::Latency => eligible
                .iter()
                .min_by(|a, b| a.avg_latency_ms().total_cmp(&b.avg_latency_ms()))
                .copied()
                .unwrap(),
        };

        Ok(Arc::clone(chosen))
    }

    pub fn on_start(&self, backend: &Backend) {
        backend.active_requests.fetch_add(1, Ordering::Relaxed);
        backend.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// EMA update: `avg <- 0.9*avg + 0.1*latency` (spec §4.6).
    pub fn on_end(&self, backend: &Backend, latency: Duration, success: bool) {
        backend.active_requests.fetch_sub(1, Ordering::Relaxed);
        if !success {
            backend.total_errors.fetch_add(1, Ordering::Relaxed);
        }

        let latency_ms = latency.as_secs_f64() * 1000.0;
        let prev = backend.avg_latency_ms();
        let updated = if prev == 0.0 { latency_ms } else { 0.9 * prev + 0.1 * latency_ms };
        backend.avg_latency_ms_milli.store((updated * 1000.0) as u64, Ordering::Relaxed);
    }

    /// Spawn the background health-check loop (spec §4.6). Probes every backend's health path
    /// every `health_check_interval`; trips unhealthy after 3 consecutive failures, any success
    /// resets the counter and restores healthy immediately.
    pub fn spawn_health_loop(self: &Arc<Self>) {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(balancer.health_check_interval).await;
                balancer.run_health_pass().await;
            }
        });
    }

    async fn run_health_pass(&self) {
        let backends: Vec<Arc<Backend>> = self.backends.read().await.clone();
        for backend in backends {
            let url = format!("{}{}", backend.base_url, backend.health_path);
            let healthy = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);

            if healthy {
                if backend.consecutive_failures.swap(0, Ordering::Relaxed) > 0 {
                    info!(backend = backend.id, "backend recovered");
                }
                backend.healthy.store(true, Ordering::Relaxed);
            } else {
                let failures = backend.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= CONSECUTIVE_FAILURES_TO_TRIP {
                    if backend.healthy.swap(false, Ordering::Relaxed) {
                        warn!(backend = backend.id, failures, "backend marked unhealthy");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(id: &str) -> Backend {
        Backend::new(id, "http://127.0.0.1:0", "/health", vec!["*".to_string()], 1, 10)
    }

    #[tokio::test]
    async fn test_pick_excludes_disabled_backend() {
        let lb = LoadBalancer::new(BalancerStrategy::RoundRobin, 30_000, reqwest::Client::new());
        let b = backend("only");
        b.enabled.store(false, Ordering::Relaxed);
        lb.register(b).await;

        let result = lb.pick("any-model").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_round_robin_cycles_backends() {
        let lb = LoadBalancer::new(BalancerStrategy::RoundRobin, 30_000, reqwest::Client::new());
        lb.register(backend("a")).await;
        lb.register(backend("b")).await;

        let first = lb.pick("m").await.unwrap().id.clone();
        let second = lb.pick("m").await.unwrap().id.clone();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle_backend() {
        let lb = LoadBalancer::new(BalancerStrategy::LeastConnections, 30_000, reqwest::Client::new());
        lb.register(backend("busy")).await;
        lb.register(backend("idle")).await;

        {
            let backends = lb.backends.read().await;
            backends[0].active_requests.store(5, Ordering::Relaxed);
        }

        let chosen = lb.pick("m").await.unwrap();
        assert_eq!(chosen.id, "idle");
    }

    #[tokio::test]
    async fn test_ema_latency_update() {
        let lb = LoadBalancer::new(BalancerStrategy::Latency, 30_000, reqwest::Client::new());
        let b = backend("a");
        lb.on_end(&b, Duration::from_millis(100), true);
        assert!((b.avg_latency_ms() - 100.0).abs() < 0.01);
        lb.on_end(&b, Duration::from_millis(200), true);
        assert!((b.avg_latency_ms() - 110.0).abs() < 0.01);
    }

    #[test]
    fn test_three_consecutive_failures_trip_unhealthy_threshold_constant() {
        assert_eq!(CONSECUTIVE_FAILURES_TO_TRIP, 3);
    }
}
