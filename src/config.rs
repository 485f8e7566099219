//! Configuration for the LLM orchestrator service.
//!
//! All configuration is loaded from environment variables at startup.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Top-level orchestrator configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub binary_provider: BinaryProviderConfig,
    pub generation: GenerationConfig,
    pub observability: ObservabilityConfig,
    pub balancer: BalancerConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

/// Model cache (C4) configuration — capacity, ports, defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of resident worker processes.
    pub max_instances: usize,
    /// First port handed out to workers; the pool spans
    /// `[base_port, base_port + max_instances)`.
    pub base_port: u16,
    /// Total RAM available to the host, in MiB. Probed at startup unless overridden,
    /// so tests and constrained environments can pin a deterministic value.
    pub system_ram_mb: Option<u64>,
    /// Model id protected from LRU eviction.
    pub default_model: Option<String>,
    /// Directory scanned by `prewarmAll`/`warmAll` for model files.
    pub model_dir: Option<PathBuf>,
    /// Re-spawn a worker once after an unexpected exit, observed by the liveness monitor.
    pub auto_restart: bool,
}

/// Binary Provider (C1) configuration.
#[derive(Debug, Clone)]
pub struct BinaryProviderConfig {
    /// Explicit path to the worker binary, skipping discovery entirely.
    pub override_path: Option<PathBuf>,
    /// Local directory binaries are fetched into and searched first.
    pub install_dir: PathBuf,
}

/// Generation defaults applied when a request omits sampling parameters.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub default_temperature: f32,
    pub default_top_p: f32,
    pub default_max_tokens: usize,
    pub max_tokens_limit: usize,
}

/// Observability configuration (logging format, service name tag).
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub service_name: String,
    pub log_format: LogFormat,
}

/// Load-balancer (C6) configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub strategy: BalancerStrategy,
    pub health_check_interval_ms: u64,
}

/// Log format type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Backend-selection strategy for the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Latency,
}

impl OrchestratorConfig {
    /// Load configuration from environment variables. Call once at startup.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            server: ServerConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            binary_provider: BinaryProviderConfig::from_env()?,
            generation: GenerationConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
            balancer: BalancerConfig::from_env()?,
        };

        config.log_environment_config();

        Ok(config)
    }

    fn log_environment_config(&self) {
        tracing::info!(
            max_instances = self.cache.max_instances,
            base_port = self.cache.base_port,
            default_model = ?self.cache.default_model,
            "Model cache configured"
        );

        if let Some(ref dir) = self.cache.model_dir {
            if dir.exists() {
                tracing::info!(model_dir = %dir.display(), "Model directory configured and exists");
            } else {
                tracing::warn!(model_dir = %dir.display(), "Model directory configured but does not exist");
            }
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            hostname: env::var("ORCHD_HOSTNAME").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("ORCHD_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("ORCHD_PORT must be a number")?,
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        })
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_instances: env::var("ORCHD_MAX_INSTANCES")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("ORCHD_MAX_INSTANCES must be a number")?,
            base_port: env::var("ORCHD_WORKER_BASE_PORT")
                .unwrap_or_else(|_| "8300".to_string())
                .parse()
                .context("ORCHD_WORKER_BASE_PORT must be a number")?,
            system_ram_mb: env::var("ORCHD_SYSTEM_RAM_MB")
                .ok()
                .map(|v| v.parse().context("ORCHD_SYSTEM_RAM_MB must be a number"))
                .transpose()?,
            default_model: env::var("ORCHD_DEFAULT_MODEL").ok(),
            model_dir: env::var("ORCHD_MODEL_DIR").ok().map(PathBuf::from),
            auto_restart: env::var("ORCHD_AUTO_RESTART")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("ORCHD_AUTO_RESTART must be true or false")?,
        })
    }
}

impl BinaryProviderConfig {
    pub fn from_env() -> Result<Self> {
        let install_dir = env::var("ORCHD_WORKER_BINARY_INSTALL_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(default_install_dir);

        Ok(Self {
            override_path: env::var("ORCHD_WORKER_BINARY_OVERRIDE").ok().map(PathBuf::from),
            install_dir,
        })
    }
}

fn default_install_dir() -> PathBuf {
    dirs_home().join(".cache").join("orchd").join("bin")
}

fn dirs_home() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl GenerationConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            default_temperature: env::var("ORCHD_DEFAULT_TEMPERATURE")
                .unwrap_or_else(|_| "0.7".to_string())
                .parse()
                .context("ORCHD_DEFAULT_TEMPERATURE must be a number")?,
            default_top_p: env::var("ORCHD_DEFAULT_TOP_P")
                .unwrap_or_else(|_| "0.9".to_string())
                .parse()
                .context("ORCHD_DEFAULT_TOP_P must be a number")?,
            default_max_tokens: env::var("ORCHD_DEFAULT_MAX_TOKENS")
                .unwrap_or_else(|_| "512".to_string())
                .parse()
                .context("ORCHD_DEFAULT_MAX_TOKENS must be a number")?,
            max_tokens_limit: env::var("ORCHD_MAX_TOKENS_LIMIT")
                .unwrap_or_else(|_| "4096".to_string())
                .parse()
                .context("ORCHD_MAX_TOKENS_LIMIT must be a number")?,
        })
    }

    /// Validate and clamp temperature to valid range.
    pub fn validate_temperature(&self, temperature: f32) -> f32 {
        temperature.clamp(0.0, 2.0)
    }

    /// Validate and clamp top_p to valid range.
    pub fn validate_top_p(&self, top_p: f32) -> f32 {
        top_p.clamp(0.0, 1.0)
    }

    /// Validate and clamp max_tokens to the configured limit.
    pub fn validate_max_tokens(&self, max_tokens: usize) -> usize {
        max_tokens.min(self.max_tokens_limit)
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Result<Self> {
        let log_format = match env::var("ORCHD_LOG_FORMAT")
            .unwrap_or_else(|_| "json".to_string())
            .to_lowercase()
            .as_str()
        {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        Ok(Self {
            service_name: env::var("ORCHD_SERVICE_NAME")
                .unwrap_or_else(|_| "llm-orchestrator".to_string()),
            log_format,
        })
    }
}

impl BalancerConfig {
    pub fn from_env() -> Result<Self> {
        let strategy = match env::var("ORCHD_BALANCER_STRATEGY")
            .unwrap_or_else(|_| "round-robin".to_string())
            .to_lowercase()
            .as_str()
        {
            "weighted-round-robin" | "weighted" => BalancerStrategy::WeightedRoundRobin,
            "least-connections" | "least_connections" => BalancerStrategy::LeastConnections,
            "latency" => BalancerStrategy::Latency,
            _ => BalancerStrategy::RoundRobin,
        };

        Ok(Self {
            strategy,
            health_check_interval_ms: env::var("ORCHD_HEALTH_CHECK_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("ORCHD_HEALTH_CHECK_INTERVAL_MS must be a number")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_fields() {
        let cache = CacheConfig {
            max_instances: 2,
            base_port: 8300,
            system_ram_mb: Some(4096),
            default_model: Some("llama-3-8b".to_string()),
            model_dir: Some(PathBuf::from("/models")),
            auto_restart: true,
        };

        assert_eq!(cache.max_instances, 2);
        assert_eq!(cache.system_ram_mb, Some(4096));
    }

    #[test]
    fn test_generation_config_validation() {
        let config = GenerationConfig {
            default_temperature: 0.7,
            default_top_p: 0.9,
            default_max_tokens: 512,
            max_tokens_limit: 4096,
        };

        assert_eq!(config.validate_temperature(0.5), 0.5);
        assert_eq!(config.validate_temperature(-1.0), 0.0);
        assert_eq!(config.validate_temperature(3.0), 2.0);

        assert_eq!(config.validate_top_p(0.9), 0.9);
        assert_eq!(config.validate_top_p(-0.1), 0.0);
        assert_eq!(config.validate_top_p(1.5), 1.0);

        assert_eq!(config.validate_max_tokens(100), 100);
        assert_eq!(config.validate_max_tokens(5000), 4096);
    }

    #[test]
    fn test_balancer_strategy_parsing() {
        assert_eq!(
            BalancerConfig::from_env().unwrap().strategy,
            BalancerStrategy::RoundRobin
        );
    }
}
