//! Model Cache (C4) — the hard part.
//!
//! Owns every resident worker process: enforces capacity, deduplicates concurrent loads via a
//! pending-load broadcast channel, runs the two-phase readiness handshake, evicts by LRU, and
//! monitors liveness in the background. Grounded on the teacher's `llm.rs` lazy-load-on-miss
//! shape and `core/retry.rs`'s generic retry-loop idiom for the readiness poll, generalized
//! from in-process model loading to subprocess lifecycle management — per spec §9, state lives
//! in an explicit `ModelCache` constructed in `main`, not a `OnceCell`/`Lazy` global.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::binary_provider::BinaryProvider;
use crate::errors::OrchestratorError;
use crate::host::HostInfo;
use crate::tracker::{LoadingTracker, Phase};
use crate::warmer::PageCacheWarmer;
use crate::worker_args::{compute_worker_args, to_cli_flags, WorkerArgs, WorkerArgsOverrides};

/// Budget for the "server up" phase of the readiness handshake (spec §4.4.6, open question
/// (a): we adopt the more recent 15s/300s profile).
const SERVER_START_TIMEOUT: Duration = Duration::from_secs(15);
const SERVER_START_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Budget for the "model loaded" phase.
const MODEL_LOAD_TIMEOUT: Duration = Duration::from_secs(300);
const MODEL_LOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_millis(2000);
const PORT_FREE_POLL_ATTEMPTS: u32 = 5;
const PORT_FREE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LIVENESS_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Extra headroom required on top of a model's size before a load is admitted (spec §4.4.3).
const CAPACITY_HEADROOM_MB: u64 = 1024;

/// A resident worker process.
pub struct WorkerInstance {
    pub model_id: String,
    pub port: u16,
    pub model_path: String,
    pub projector_path: Option<String>,
    pub last_access: Instant,
    child: Child,
}

/// Public, cloneable snapshot of a resident worker (no process handle).
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub model_id: String,
    pub port: u16,
    pub last_access_ms_ago: u64,
}

/// Outcome of a `hotSwap` call (spec §4.4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HotSwapMethod {
    Preloaded,
    Warm,
    Cold,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HotSwapResult {
    pub method: HotSwapMethod,
    pub from_model: Option<String>,
    pub to_model: String,
    pub elapsed_ms: u64,
    pub port: u16,
}

/// Aggregate cache snapshot for the stats endpoint (spec §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub max_instances: usize,
    pub current_count: usize,
    pub models: Vec<WorkerSnapshot>,
    pub default_model: Option<String>,
    pub mlock_enabled: bool,
    pub system_ram_mb: u64,
    pub warmed_models: usize,
    pub total_warmed_mb: u64,
}

enum PendingOutcome {
    Ready,
    Failed(String),
}

struct CacheState {
    instances: HashMap<String, WorkerInstance>,
    port_to_model: HashMap<u16, String>,
    used_ports: HashSet<u16>,
    pending_loads: HashMap<String, broadcast::Sender<PendingOutcome>>,
}

impl Clone for PendingOutcome {
    fn clone(&self) -> Self {
        match self {
            PendingOutcome::Ready => PendingOutcome::Ready,
            PendingOutcome::Failed(msg) => PendingOutcome::Failed(msg.clone()),
        }
    }
}

/// The Model Cache. Constructed once in `main` and shared via `web::Data`/`Arc`.
pub struct ModelCache {
    state: Mutex<CacheState>,
    host: HostInfo,
    warmer: Arc<PageCacheWarmer>,
    tracker: Arc<LoadingTracker>,
    binary_provider: Arc<BinaryProvider>,
    http: reqwest::Client,
    base_port: u16,
    max_instances: AtomicUsize,
    system_ram_mb: AtomicU16Holder,
    default_model: RwLock<Option<String>>,
    auto_restart: bool,
    overrides: RwLock<WorkerArgsOverrides>,
    #[cfg(test)]
    load_fresh_calls: AtomicUsize,
}

/// `system_ram_mb` wants a `u64` but we only ever store values well under `u16::MAX * 64`;
/// kept as a small wrapper purely so the atomic type reads clearly at call sites.
struct AtomicU16Holder(std::sync::atomic::AtomicU64);

impl AtomicU16Holder {
    fn new(v: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(v))
    }
    fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
    fn store(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed)
    }
}

impl ModelCache {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: HostInfo,
        warmer: Arc<PageCacheWarmer>,
        tracker: Arc<LoadingTracker>,
        binary_provider: Arc<BinaryProvider>,
        http: reqwest::Client,
        base_port: u16,
        max_instances: usize,
        system_ram_mb: Option<u64>,
        default_model: Option<String>,
        auto_restart: bool,
    ) -> Self {
        let ram = system_ram_mb.unwrap_or(host.total_ram_mb);
        Self {
            state: Mutex::new(CacheState {
                instances: HashMap::new(),
                port_to_model: HashMap::new(),
                used_ports: HashSet::new(),
                pending_loads: HashMap::new(),
            }),
            host,
            warmer,
            tracker,
            binary_provider,
            http,
            base_port,
            max_instances: AtomicUsize::new(max_instances),
            system_ram_mb: AtomicU16Holder::new(ram),
            default_model: RwLock::new(default_model),
            auto_restart,
            overrides: RwLock::new(WorkerArgsOverrides::default()),
            #[cfg(test)]
            load_fresh_calls: AtomicUsize::new(0),
        }
    }

    /// Spawn the background liveness monitor (spec §4.4.8). Intended to be spawned once from
    /// `main` onto the shared `Arc<ModelCache>`.
    pub fn spawn_liveness_monitor(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LIVENESS_MONITOR_INTERVAL).await;
                cache.run_liveness_pass().await;
            }
        });
    }

    async fn run_liveness_pass(&self) {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.instances.keys().cloned().collect()
        };

        for model_id in ids {
            let dead = {
                let mut state = self.state.lock().await;
                match state.instances.get_mut(&model_id) {
                    Some(instance) => matches!(instance.child.try_wait(), Ok(Some(_))),
                    None => false,
                }
            };

            if !dead {
                continue;
            }

            warn!(model_id, "liveness monitor detected dead worker");
            let removed = self.remove_instance(&model_id).await;

            if self.auto_restart
                && let Some((model_path, projector_path)) = removed
            {
                info!(model_id, "auto-restarting crashed worker");
                if let Err(e) = self.get_or_load(&model_id, &model_path, projector_path).await {
                    warn!(model_id, error = %e, "auto-restart failed");
                }
            }
        }
    }

    /// The canonical `getOrLoad` protocol (spec §4.4.3).
    pub async fn get_or_load(
        &self,
        model_id: &str,
        model_path: &str,
        projector_path: Option<String>,
    ) -> Result<WorkerSnapshot, OrchestratorError> {
        // Step 3: stat the model file and check capacity. Doesn't touch shared state, so it's
        // safe to do before the atomic claim below.
        let metadata = tokio::fs::metadata(model_path)
            .await
            .map_err(|_| OrchestratorError::ModelNotFound(model_path.to_string()))?;
        let size_mb = (metadata.len() / (1024 * 1024)).max(1);
        let required_mb = size_mb + CAPACITY_HEADROOM_MB;
        let available_mb = self.system_ram_mb.load();
        if required_mb > available_mb {
            return Err(OrchestratorError::CapacityExceeded {
                model_id: model_id.to_string(),
                required_mb,
                available_mb,
            });
        }

        // Steps 1-2, 4 and 5 collapse into a single atomic claim: under one lock acquisition,
        // either subscribe to an in-flight load, note a live instance's port, or stake ownership
        // of a fresh load by inserting the pending-load entry ourselves. Doing this as one
        // critical section is what makes concurrent-load dedup exact — checking and inserting in
        // separate acquisitions leaves a window where two callers both see "nothing in flight".
        enum Claim {
            Pending(broadcast::Receiver<PendingOutcome>),
            ExistingPort(u16),
            Owner(broadcast::Sender<PendingOutcome>),
        }

        let claim = {
            let mut state = self.state.lock().await;
            if let Some(tx) = state.pending_loads.get(model_id) {
                Claim::Pending(tx.subscribe())
            } else if let Some(instance) = state.instances.get(model_id) {
                Claim::ExistingPort(instance.port)
            } else {
                let (tx, _rx) = broadcast::channel(1);
                state.pending_loads.insert(model_id.to_string(), tx.clone());
                Claim::Owner(tx)
            }
        };

        let tx = match claim {
            Claim::Pending(mut rx) => {
                return match rx.recv().await {
                    Ok(PendingOutcome::Ready) => self.snapshot_of(model_id).await,
                    Ok(PendingOutcome::Failed(msg)) => {
                        Err(OrchestratorError::WorkerExited { model_id: model_id.to_string(), message: msg })
                    }
                    Err(_) => self.get_or_load_boxed(model_id, model_path, projector_path).await,
                };
            }
            Claim::ExistingPort(port) => {
                let alive = {
                    let mut state = self.state.lock().await;
                    match state.instances.get_mut(model_id) {
                        Some(instance) => !matches!(instance.child.try_wait(), Ok(Some(_))),
                        None => false,
                    }
                };

                if alive && self.probe_health(port).await {
                    let mut state = self.state.lock().await;
                    if let Some(instance) = state.instances.get_mut(model_id) {
                        instance.last_access = Instant::now();
                        return Ok(WorkerSnapshot {
                            model_id: model_id.to_string(),
                            port: instance.port,
                            last_access_ms_ago: 0,
                        });
                    }
                }

                // Dead or unhealthy: clean up and re-enter the protocol to claim ownership.
                self.remove_instance(model_id).await;
                return self.get_or_load_boxed(model_id, model_path, projector_path).await;
            }
            Claim::Owner(tx) => tx,
        };

        let is_warm = self
            .warmer
            .status(std::path::Path::new(model_path))
            .await
            .map(|s| !s.is_cold())
            .unwrap_or(false);
        self.tracker.start(model_id, size_mb, is_warm);

        let result = self.load_fresh(model_id, model_path, size_mb, projector_path.clone()).await;

        {
            let mut state = self.state.lock().await;
            state.pending_loads.remove(model_id);
        }

        match &result {
            Ok(_) => {
                let _ = tx.send(PendingOutcome::Ready);
                self.tracker.complete(true, None);
                let path = model_path.to_string();
                let warmer = Arc::clone(&self.warmer);
                tokio::spawn(async move {
                    let _ = warmer.warm(std::path::Path::new(&path)).await;
                });
            }
            Err(e) => {
                let _ = tx.send(PendingOutcome::Failed(e.to_string()));
                self.tracker.complete(false, Some(e.to_string()));
            }
        }

        result?;
        self.snapshot_of(model_id).await
    }

    // `get_or_load` is not recursive by construction (pending channel senders are never
    // dropped mid-flight without an outcome), but `Err(_)` on `recv` (sender dropped without a
    // value, which cannot happen on the happy path) falls back to re-entering the protocol
    // rather than panicking.
    fn get_or_load_boxed<'a>(
        &'a self,
        model_id: &'a str,
        model_path: &'a str,
        projector_path: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<WorkerSnapshot, OrchestratorError>> + Send + 'a>> {
        Box::pin(self.get_or_load(model_id, model_path, projector_path))
    }

    async fn load_fresh(
        &self,
        model_id: &str,
        model_path: &str,
        size_mb: u64,
        projector_path: Option<String>,
    ) -> Result<(), OrchestratorError> {
        #[cfg(test)]
        self.load_fresh_calls.fetch_add(1, Ordering::Relaxed);

        self.warmer.pause();

        let port = {
            let mut state = self.state.lock().await;

            let max_instances = self.max_instances.load(Ordering::Relaxed);
            if max_instances == 1 && !state.instances.is_empty() {
                let ids: Vec<String> = state.instances.keys().cloned().collect();
                drop(state);
                for id in ids {
                    self.remove_instance(&id).await;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                state = self.state.lock().await;
            } else if state.instances.len() >= max_instances {
                drop(state);
                self.evict_lru().await;
                state = self.state.lock().await;
            }

            let port = self.pick_port(&state, max_instances);
            state.used_ports.insert(port);
            state.port_to_model.insert(port, model_id.to_string());
            port
        };

        self.kill_stray_on_port(port).await;

        let overrides = self.overrides.read().await.clone();
        let args = compute_worker_args(&self.host, size_mb, &overrides, projector_path.clone());

        self.tracker.update_phase(Phase::Starting, 10, "spawning worker process");

        let spawn_result = self.spawn_worker(&args, port, model_path).await;
        let child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.release_port(port).await;
                self.warmer.resume();
                return Err(OrchestratorError::SpawnFailed(e.to_string()));
            }
        };

        let instance = WorkerInstance {
            model_id: model_id.to_string(),
            port,
            model_path: model_path.to_string(),
            projector_path,
            last_access: Instant::now(),
            child,
        };

        {
            let mut state = self.state.lock().await;
            state.instances.insert(model_id.to_string(), instance);
        }

        let handshake = self.run_readiness_handshake(model_id, port).await;
        self.warmer.resume();

        if let Err(e) = handshake {
            self.remove_instance(model_id).await;
            return Err(e);
        }

        self.issue_background_warmup(port);

        Ok(())
    }

    fn pick_port(&self, state: &CacheState, max_instances: usize) -> u16 {
        if max_instances == 1 {
            return self.base_port;
        }
        for offset in 0..max_instances as u16 {
            let candidate = self.base_port + offset;
            if !state.used_ports.contains(&candidate) {
                return candidate;
            }
        }
        self.base_port
    }

    async fn kill_stray_on_port(&self, port: u16) {
        // Best-effort: a TCP connect probe is enough to decide whether *something* is bound;
        // we do not attempt to identify or signal a foreign process on this port.
        if std::net::TcpStream::connect_timeout(
            &format!("127.0.0.1:{port}").parse().unwrap(),
            Duration::from_millis(50),
        )
        .is_ok()
        {
            warn!(port, "port was already bound before worker spawn; proceeding anyway");
        }
    }

    async fn spawn_worker(
        &self,
        args: &WorkerArgs,
        port: u16,
        model_path: &str,
    ) -> anyhow::Result<Child> {
        let binary = self.binary_provider.locate_binary(self.host.gpu).await?;

        let flags = to_cli_flags(args, port, model_path);

        let child = Command::new(binary)
            .args(flags)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        Ok(child)
    }

    async fn run_readiness_handshake(&self, model_id: &str, port: u16) -> Result<(), OrchestratorError> {
        let start = Instant::now();
        while start.elapsed() < SERVER_START_TIMEOUT {
            if self.process_exited(model_id).await {
                return Err(OrchestratorError::WorkerExited {
                    model_id: model_id.to_string(),
                    message: "process exited before server start".to_string(),
                });
            }
            if self.probe_health(port).await {
                break;
            }
            tokio::time::sleep(SERVER_START_POLL_INTERVAL).await;
        }
        if start.elapsed() >= SERVER_START_TIMEOUT {
            return Err(OrchestratorError::ReadinessTimeout {
                model_id: model_id.to_string(),
                phase: "server_start",
            });
        }

        self.tracker.update_phase(Phase::Loading, 40, "model loading");

        let load_start = Instant::now();
        while load_start.elapsed() < MODEL_LOAD_TIMEOUT {
            if self.process_exited(model_id).await {
                return Err(OrchestratorError::WorkerExited {
                    model_id: model_id.to_string(),
                    message: "process exited during model load".to_string(),
                });
            }
            if self.probe_models_ready(port).await {
                return Ok(());
            }
            self.tracker.update_loading_progress("model loading");
            tokio::time::sleep(MODEL_LOAD_POLL_INTERVAL).await;
        }

        Err(OrchestratorError::ReadinessTimeout { model_id: model_id.to_string(), phase: "model_load" })
    }

    async fn process_exited(&self, model_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.instances.get_mut(model_id) {
            Some(instance) => matches!(instance.child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    async fn probe_health(&self, port: u16) -> bool {
        self.http
            .get(format!("http://127.0.0.1:{port}/health"))
            .timeout(Duration::from_millis(500))
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().as_u16() == 503)
            .unwrap_or(false)
    }

    async fn probe_models_ready(&self, port: u16) -> bool {
        self.http
            .get(format!("http://127.0.0.1:{port}/v1/models"))
            .timeout(Duration::from_millis(1000))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn issue_background_warmup(&self, port: u16) {
        let http = self.http.clone();
        tokio::spawn(async move {
            let body = serde_json::json!({
                "prompt": "hi",
                "max_tokens": 1,
                "temperature": 0.0,
            });
            let _ = http
                .post(format!("http://127.0.0.1:{port}/v1/completions"))
                .json(&body)
                .timeout(Duration::from_secs(10))
                .send()
                .await;
        });
    }

    async fn snapshot_of(&self, model_id: &str) -> Result<WorkerSnapshot, OrchestratorError> {
        let state = self.state.lock().await;
        state
            .instances
            .get(model_id)
            .map(|instance| WorkerSnapshot {
                model_id: model_id.to_string(),
                port: instance.port,
                last_access_ms_ago: instance.last_access.elapsed().as_millis() as u64,
            })
            .ok_or_else(|| {
                OrchestratorError::InternalInvariantViolation(format!(
                    "load for {model_id} reported success but no instance is resident"
                ))
            })
    }

    /// Evict the LRU instance, skipping the protected default unless it is the only resident
    /// model (spec §4.4.5).
    async fn evict_lru(&self) {
        let default = self.default_model.read().await.clone();

        let victim = {
            let state = self.state.lock().await;
            state
                .instances
                .values()
                .filter(|i| Some(&i.model_id) != default.as_ref())
                .min_by_key(|i| i.last_access)
                .map(|i| i.model_id.clone())
                .or_else(|| state.instances.values().min_by_key(|i| i.last_access).map(|i| i.model_id.clone()))
        };

        if let Some(id) = victim {
            self.remove_instance(&id).await;
        }
    }

    /// Unload a specific model. Returns `true` if a resident instance was removed.
    pub async fn unload(&self, model_id: &str) -> bool {
        self.remove_instance(model_id).await.is_some()
    }

    /// Unload every resident model. Snapshots the id set first so the live map is never
    /// iterated while being mutated (spec §4.4.7).
    pub async fn unload_all(&self) {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.instances.keys().cloned().collect()
        };
        for id in ids {
            self.remove_instance(&id).await;
        }
    }

    /// Gracefully terminate, then force-kill, the instance for `model_id`, releasing its port.
    /// Returns the `(model_path, projector_path)` of the removed instance, if any, so callers
    /// (e.g. auto-restart) can reload it.
    async fn remove_instance(&self, model_id: &str) -> Option<(String, Option<String>)> {
        let mut instance = {
            let mut state = self.state.lock().await;
            state.instances.remove(model_id)
        }?;

        let port = instance.port;

        // Best-effort graceful shutdown: the worker protocol has no SIGTERM-equivalent over
        // HTTP in this corpus, so we go straight to process termination with a grace window.
        let _ = instance.child.start_kill();
        let wait = tokio::time::timeout(GRACEFUL_SHUTDOWN_GRACE, instance.child.wait()).await;
        if wait.is_err() {
            let _ = instance.child.kill().await;
        }

        {
            let mut state = self.state.lock().await;
            state.port_to_model.remove(&port);
            state.used_ports.remove(&port);
        }

        self.poll_port_free(port).await;

        Some((instance.model_path, instance.projector_path))
    }

    async fn release_port(&self, port: u16) {
        let mut state = self.state.lock().await;
        state.port_to_model.remove(&port);
        state.used_ports.remove(&port);
    }

    async fn poll_port_free(&self, port: u16) {
        for _ in 0..PORT_FREE_POLL_ATTEMPTS {
            let bound = std::net::TcpStream::connect_timeout(
                &format!("127.0.0.1:{port}").parse().unwrap(),
                Duration::from_millis(50),
            )
            .is_ok();
            if !bound {
                return;
            }
            tokio::time::sleep(PORT_FREE_POLL_INTERVAL).await;
        }
    }

    /// Non-blocking liveness check: does this model have a resident, non-exited process?
    pub async fn is_alive(&self, model_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.instances.get_mut(model_id) {
            Some(instance) => !matches!(instance.child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    /// Hot-swap to `target_id` (spec §4.4.9). This is `getOrLoad` with richer telemetry, not a
    /// distinct loading path.
    pub async fn hot_swap(
        &self,
        target_id: &str,
        path: &str,
        projector_path: Option<String>,
    ) -> Result<HotSwapResult, OrchestratorError> {
        let start = Instant::now();

        if self.is_alive(target_id).await {
            let snapshot = self.snapshot_of(target_id).await?;
            return Ok(HotSwapResult {
                method: HotSwapMethod::Preloaded,
                from_model: None,
                to_model: target_id.to_string(),
                elapsed_ms: start.elapsed().as_millis() as u64,
                port: snapshot.port,
            });
        }

        let from_model = {
            let state = self.state.lock().await;
            state.instances.keys().next().cloned()
        };

        let is_warm = self
            .warmer
            .status(std::path::Path::new(path))
            .await
            .map(|s| !s.is_cold())
            .unwrap_or(false);

        let snapshot = self.get_or_load(target_id, path, projector_path).await?;

        Ok(HotSwapResult {
            method: if is_warm { HotSwapMethod::Warm } else { HotSwapMethod::Cold },
            from_model,
            to_model: target_id.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
            port: snapshot.port,
        })
    }

    /// Prewarm a single model file's page cache without loading a worker (spec §4.2/§4.4).
    pub async fn prewarm(&self, path: &str) -> anyhow::Result<()> {
        self.warmer.warm(std::path::Path::new(path)).await.map(|_| ())
    }

    pub async fn fast_prewarm(&self, path: &str) -> anyhow::Result<()> {
        self.warmer.fast_prewarm(std::path::Path::new(path)).await.map(|_| ())
    }

    pub async fn prewarm_all(self: &Arc<Self>, dir: &std::path::Path) {
        self.warmer.warm_all(dir).await;
    }

    pub async fn set_default(&self, model_id: Option<String>) {
        *self.default_model.write().await = model_id;
    }

    pub fn set_capacity(&self, n: usize) {
        self.max_instances.store(n.max(1), Ordering::Relaxed);
    }

    pub fn set_system_ram_mb(&self, mb: u64) {
        self.system_ram_mb.store(mb);
    }

    pub async fn set_overrides(&self, overrides: WorkerArgsOverrides) {
        *self.overrides.write().await = overrides;
    }

    pub fn loading_progress(&self) -> crate::tracker::Progress {
        self.tracker.get_progress()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<crate::tracker::Progress> {
        self.tracker.subscribe()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let models: Vec<WorkerSnapshot> = state
            .instances
            .values()
            .map(|i| WorkerSnapshot {
                model_id: i.model_id.clone(),
                port: i.port,
                last_access_ms_ago: i.last_access.elapsed().as_millis() as u64,
            })
            .collect();

        CacheStats {
            max_instances: self.max_instances.load(Ordering::Relaxed),
            current_count: models.len(),
            models,
            default_model: self.default_model.read().await.clone(),
            mlock_enabled: self.host.can_lock_memory(1024),
            system_ram_mb: self.system_ram_mb.load(),
            warmed_models: self.warmer.warmed_models().await.len(),
            total_warmed_mb: self.warmer.total_warmed_mb().await,
        }
    }

    #[cfg(test)]
    pub async fn resident_count(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    #[cfg(test)]
    pub fn load_fresh_calls(&self) -> usize {
        self.load_fresh_calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_host() -> HostInfo {
        HostInfo { total_ram_mb: 8192, physical_cores: 4, gpu: crate::host::GpuKind::None }
    }

    fn test_binary_provider() -> Arc<BinaryProvider> {
        Arc::new(BinaryProvider::new(None, std::path::PathBuf::from("/nonexistent"), reqwest::Client::new()))
    }

    fn test_cache() -> ModelCache {
        ModelCache::new(
            test_host(),
            Arc::new(PageCacheWarmer::new()),
            Arc::new(LoadingTracker::new()),
            test_binary_provider(),
            reqwest::Client::new(),
            18300,
            1,
            Some(4096),
            None,
            true,
        )
    }

    #[tokio::test]
    async fn test_model_not_found_is_rejected_before_spawn() {
        let cache = test_cache();
        let result = cache.get_or_load("missing", "/no/such/path.gguf", None).await;
        assert!(matches!(result, Err(OrchestratorError::ModelNotFound(_))));
        assert_eq!(cache.resident_count().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_rejects_oversized_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.gguf");
        std::fs::write(&path, vec![0u8; 1024]).unwrap(); // 1 KiB file, but we force ram tiny

        let cache = ModelCache::new(
            test_host(),
            Arc::new(PageCacheWarmer::new()),
            Arc::new(LoadingTracker::new()),
            test_binary_provider(),
            reqwest::Client::new(),
            18301,
            1,
            Some(100), // 100 MiB budget, headroom alone is 1024 MiB
            None,
            true,
        );

        let result = cache.get_or_load("big", path.to_str().unwrap(), None).await;
        assert!(matches!(result, Err(OrchestratorError::CapacityExceeded { .. })));
    }

    #[tokio::test]
    async fn test_set_capacity_and_default() {
        let cache = test_cache();
        cache.set_capacity(3);
        cache.set_default(Some("llama-3-8b".to_string())).await;
        let stats = cache.stats().await;
        assert_eq!(stats.max_instances, 3);
        assert_eq!(stats.default_model.as_deref(), Some("llama-3-8b"));
    }

    #[tokio::test]
    async fn test_unload_nonexistent_is_noop() {
        let cache = test_cache();
        assert!(!cache.unload("not-loaded").await);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_load_dedups_to_one_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("a.gguf");
        std::fs::write(&model_path, vec![0u8; 1024]).unwrap();
        let model_path = model_path.to_str().unwrap().to_string();

        // A non-executable regular file as the "binary": resolves without a network fetch, but
        // `Command::spawn` fails fast and locally (permission denied), so the race window under
        // test is exercised without depending on outside network access.
        let fake_binary = dir.path().join("orchd-worker");
        std::fs::write(&fake_binary, b"not a real binary").unwrap();
        let binary_provider =
            Arc::new(BinaryProvider::new(Some(fake_binary), std::path::PathBuf::from("/nonexistent"), reqwest::Client::new()));

        let cache = Arc::new(ModelCache::new(
            test_host(),
            Arc::new(PageCacheWarmer::new()),
            Arc::new(LoadingTracker::new()),
            binary_provider,
            reqwest::Client::new(),
            18302,
            1,
            Some(4096),
            None,
            true,
        ));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            let model_path = model_path.clone();
            handles.push(tokio::spawn(async move { cache.get_or_load("a", &model_path, None).await }));
        }

        for handle in handles {
            // Every call resolves to the same spawn failure; the property under test is the
            // spawn count below, not the outcome.
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(OrchestratorError::SpawnFailed(_)) | Err(OrchestratorError::WorkerExited { .. })));
        }

        assert_eq!(cache.load_fresh_calls(), 1);
    }
}
