//! Offline LLM serving orchestrator entry point.
//!
//! Hides a pool of local inference worker subprocesses behind a single logical, OpenAI-
//! compatible HTTP endpoint: the Model Cache (C4) owns worker lifecycle, the Worker Proxy (C5)
//! translates requests, and the Load Balancer (C6) distributes across multiple backends when
//! more than one is registered.

mod api;
mod balancer;
mod binary_provider;
mod cache;
mod config;
mod errors;
mod host;
mod models;
mod observability;
mod proxy;
mod tracker;
mod worker_args;
mod warmer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::Result;
use dotenvy::dotenv;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_actix_web::AppExt;
use utoipa_swagger_ui::SwaggerUi;

use balancer::LoadBalancer;
use binary_provider::BinaryProvider;
use cache::ModelCache;
use config::OrchestratorConfig;
use host::HostInfo;
use observability::Metrics;
use proxy::WorkerProxy;
use tracker::Phase;
use warmer::PageCacheWarmer;

/// Shared application state. Replaces the teacher's global `OnceCell` singletons (spec §9:
/// "Global mutable state in the source") with explicit context objects constructed once in
/// `main` and threaded to every handler via `web::Data`.
pub struct AppState {
    pub config: OrchestratorConfig,
    pub cache: Arc<ModelCache>,
    pub proxy: Arc<WorkerProxy>,
    pub balancer: Arc<LoadBalancer>,
    pub model_dir: PathBuf,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "LLM Orchestrator",
        description = "Offline LLM serving orchestrator: model lifecycle, hot-swap, and cross-backend load balancing in front of local inference worker processes",
        version = "1.0.0"
    ),
    tags(
        (name = "health", description = "Liveness/readiness probes"),
        (name = "models", description = "Model discovery"),
        (name = "chat", description = "OpenAI-compatible chat completions"),
        (name = "completions", description = "OpenAI-compatible text completions"),
        (name = "admin", description = "Model cache, tuning, and load-balancer control surface")
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config = OrchestratorConfig::from_env()?;

    let (prometheus, metrics) = observability::init_observability(&config.observability)?;
    let metrics = Arc::new(metrics);

    let host = HostInfo::probe(config.cache.system_ram_mb);
    info!(
        total_ram_mb = host.total_ram_mb,
        physical_cores = host.physical_cores,
        gpu = ?host.gpu,
        "host resources probed"
    );

    let http = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .build()?;

    let warmer = Arc::new(PageCacheWarmer::new());
    let tracker_handle = Arc::new(tracker::LoadingTracker::new());
    let binary_provider = Arc::new(BinaryProvider::new(
        config.binary_provider.override_path.clone(),
        config.binary_provider.install_dir.clone(),
        http.clone(),
    ));

    let cache = Arc::new(ModelCache::new(
        host,
        Arc::clone(&warmer),
        Arc::clone(&tracker_handle),
        Arc::clone(&binary_provider),
        http.clone(),
        config.cache.base_port,
        config.cache.max_instances,
        config.cache.system_ram_mb,
        config.cache.default_model.clone(),
        config.cache.auto_restart,
    ));
    cache.spawn_liveness_monitor();

    let proxy = Arc::new(WorkerProxy::new(http.clone(), Arc::clone(&metrics)));

    let balancer = Arc::new(LoadBalancer::new(
        config.balancer.strategy,
        config.balancer.health_check_interval_ms,
        http.clone(),
    ));
    balancer.spawn_health_loop();

    let model_dir = config.cache.model_dir.clone().unwrap_or_else(|| PathBuf::from("."));

    spawn_default_model_prewarm(Arc::clone(&cache), model_dir.clone(), config.cache.default_model.clone());
    spawn_metrics_sync_loop(Arc::clone(&cache), Arc::clone(&balancer), Arc::clone(&metrics));
    spawn_progress_metrics_loop(Arc::clone(&cache), Arc::clone(&metrics));

    let hostname = config.server.hostname.clone();
    let port = config.server.port;
    let cors_origins = config.server.cors_allowed_origins.clone();

    let app_state = web::Data::new(AppState { config, cache, proxy, balancer, model_dir });

    info!(hostname = %hostname, port, "starting llm-orchestrator");

    let server = HttpServer::new(move || {
        let cors = if cors_origins.contains(&"*".to_string()) {
            Cors::permissive()
        } else {
            let mut cors = Cors::default()
                .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                .allowed_headers(vec![
                    actix_web::http::header::CONTENT_TYPE,
                    actix_web::http::header::AUTHORIZATION,
                ])
                .supports_credentials()
                .max_age(3600);
            for origin in &cors_origins {
                cors = cors.allowed_origin(origin);
            }
            cors
        };

        App::new()
            .wrap(prometheus.clone())
            .wrap(cors)
            .wrap(Compress::default())
            .app_data(app_state.clone())
            .into_utoipa_app()
            .openapi(ApiDoc::openapi())
            .service(api::health::health_live)
            .service(api::health::health_ready)
            .service(api::admin::list_models)
            .service(api::chat::chat_completion)
            .service(api::completions::completion)
            .service(api::admin::load_model)
            .service(api::admin::unload_model)
            .service(api::admin::unload_all)
            .service(api::admin::hot_swap)
            .service(api::admin::stats)
            .service(api::admin::progress)
            .service(api::admin::progress_stream)
            .service(api::admin::set_default)
            .service(api::admin::clear_default)
            .service(api::admin::set_capacity)
            .service(api::admin::set_system_ram)
            .service(api::admin::set_tuning)
            .service(api::admin::prewarm)
            .service(api::admin::prewarm_all)
            .service(api::admin::fast_prewarm)
            .service(api::admin::list_backends)
            .service(api::admin::register_backend)
            .service(api::admin::deregister_backend)
            .openapi_service(|api| SwaggerUi::new("/swagger-ui/{_:.*}").url("/api/openapi.json", api))
            .into_app()
    });

    info!(hostname = %hostname, port, "server running at http://{}:{}", hostname, port);
    server.bind((hostname.as_str(), port))?.run().await?;

    Ok(())
}

/// If an operator configured a default model, resolve it in the local catalog and kick off a
/// background `getOrLoad` so `/health/ready` converges without waiting on first request traffic.
fn spawn_default_model_prewarm(cache: Arc<ModelCache>, model_dir: PathBuf, default_model: Option<String>) {
    let Some(default_id) = default_model else { return };
    tokio::spawn(async move {
        let catalog = match models::discover_catalog(&model_dir).await {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = %e, dir = %model_dir.display(), "could not scan model directory for default model prewarm");
                return;
            }
        };
        let Some(entry) = catalog.into_iter().find(|m| m.id == default_id) else {
            warn!(default_id, "configured default model not found in catalog; skipping startup prewarm");
            return;
        };
        if let Err(e) = cache.get_or_load(&entry.id, &entry.path, entry.projector_path).await {
            warn!(default_id, error = %e, "startup load of default model failed");
        }
    });
}

/// Periodically mirrors cache/balancer snapshots into the Prometheus gauges (spec §6 cache
/// stats shape), since those components expose pull-style `stats()`/`list()` rather than
/// pushing every mutation through a metrics hook.
fn spawn_metrics_sync_loop(cache: Arc<ModelCache>, balancer: Arc<LoadBalancer>, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;

            let stats = cache.stats().await;
            metrics.resident_models.set(stats.current_count as f64);
            metrics.warm_bytes_total.set((stats.total_warmed_mb * 1024 * 1024) as f64);

            for backend in balancer.list().await {
                metrics.backend_latency_ms.with_label_values(&[&backend.id]).set(backend.avg_latency_ms);
            }
        }
    });
}

/// Feeds the loading-tracker's progress stream into the load-duration histogram and
/// outcome counter (spec §4.3 subscription mechanism, reused for metrics rather than UI).
fn spawn_progress_metrics_loop(cache: Arc<ModelCache>, metrics: Arc<Metrics>) {
    let mut rx = cache.subscribe_progress();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(progress) => match progress.phase {
                    Phase::Ready => {
                        metrics.load_total.with_label_values(&["success"]).inc();
                        metrics.load_duration_seconds.observe(progress.elapsed_ms as f64 / 1000.0);
                    }
                    Phase::Failed => {
                        metrics.load_total.with_label_values(&["failure"]).inc();
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
