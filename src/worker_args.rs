//! Adaptive worker argument policy (spec §4.4.4).
//!
//! Pure functions computing the command-line flags passed to a freshly spawned worker,
//! given host resources and the model being loaded. Every value here is a recommendation the
//! cache applies only when the operator has not overridden it via the tuning setters.

use crate::host::{GpuKind, HostInfo};

/// GPU layer estimate used when full-offload headroom is unavailable. Architecture-dependent
/// in reality; flagged in SPEC_FULL.md §9(b) as an open question rather than silently assumed
/// to be universally correct.
const GPU_LAYER_ESTIMATE_DIVISOR: u64 = 24;

/// Fully resolved worker launch arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    pub context_window: u32,
    pub batch_size: u32,
    pub parallel_slots: u32,
    pub cpu_threads: u32,
    pub kv_cache_quant: KvCacheQuant,
    pub continuous_batching: bool,
    pub gpu_layers: u32,
    pub memory_lock: bool,
    pub flash_attention: bool,
    pub projector_path: Option<String>,
    pub speculative_draft_model: Option<String>,
}

/// KV-cache quantisation selected by RAM pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheQuant {
    Q8_0,
    F16,
}

impl KvCacheQuant {
    pub fn as_flag(&self) -> &'static str {
        match self {
            KvCacheQuant::Q8_0 => "q8_0",
            KvCacheQuant::F16 => "f16",
        }
    }
}

/// User overrides for any policy-derived field; `None` defers to the adaptive policy.
#[derive(Debug, Clone, Default, serde::Deserialize, utoipa::ToSchema)]
#[serde(default)]
pub struct WorkerArgsOverrides {
    pub context_window: Option<u32>,
    pub batch_size: Option<u32>,
    pub parallel_slots: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub flash_attention_opt_in: bool,
    pub speculative_draft_model: Option<String>,
}

/// Compute the adaptive argument set for a model of `model_size_mb`, given host resources,
/// operator overrides, and an optional multimodal projector path.
pub fn compute_worker_args(
    host: &HostInfo,
    model_size_mb: u64,
    overrides: &WorkerArgsOverrides,
    projector_path: Option<String>,
) -> WorkerArgs {
    let ram_mb = host.total_ram_mb;

    let context_window = overrides.context_window.unwrap_or_else(|| {
        if ram_mb < 8 * 1024 {
            2048
        } else if ram_mb < 16 * 1024 {
            if model_size_mb > 4 * 1024 { 2048 } else { 4096 }
        } else {
            8192
        }
    });

    let batch_size = overrides.batch_size.unwrap_or_else(|| {
        if ram_mb < 16 * 1024 {
            if model_size_mb > 4 * 1024 { 64 } else { 128 }
        } else {
            256
        }
    });

    let parallel_slots = overrides.parallel_slots.unwrap_or(1).clamp(1, 4);

    let cpu_threads = overrides
        .cpu_threads
        .unwrap_or_else(|| (host.physical_cores as u32).min(8));

    let kv_cache_quant = if ram_mb < 16 * 1024 { KvCacheQuant::Q8_0 } else { KvCacheQuant::F16 };

    let gpu_layers = compute_gpu_layers(host, model_size_mb);

    let memory_lock = host.can_lock_memory(1024) && ram_mb >= model_size_mb.saturating_mul(4);

    let flash_attention = gpu_layers > 0 && overrides.flash_attention_opt_in;

    WorkerArgs {
        context_window,
        batch_size,
        parallel_slots,
        cpu_threads,
        kv_cache_quant,
        continuous_batching: true,
        gpu_layers,
        memory_lock,
        flash_attention,
        projector_path,
        speculative_draft_model: overrides.speculative_draft_model.clone(),
    }
}

/// GPU layer offload count: full offload when free VRAM covers 2x the model size, a fractional
/// estimate otherwise, and zero layers (CPU-only) below a meaningful threshold.
fn compute_gpu_layers(host: &HostInfo, model_size_mb: u64) -> u32 {
    if host.gpu == GpuKind::None {
        return 0;
    }
    let Some(free_vram_mb) = host.free_vram_mb_estimate() else {
        return 0;
    };

    if free_vram_mb >= model_size_mb.saturating_mul(2) {
        return u32::MAX; // caller interprets as "all layers"; worker accepts a sentinel flag
    }

    let estimate = (free_vram_mb / 2) as f64 / model_size_mb.max(1) as f64
        * GPU_LAYER_ESTIMATE_DIVISOR as f64;
    let layers = estimate.floor() as u64;

    if layers >= 8 { layers as u32 } else { 0 }
}

/// Render a [`WorkerArgs`] into the subprocess command-line flags (spec §6).
pub fn to_cli_flags(args: &WorkerArgs, port: u16, model_path: &str) -> Vec<String> {
    let mut flags = vec![
        "--model".to_string(),
        model_path.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--bind".to_string(),
        "127.0.0.1".to_string(),
        "--ctx-size".to_string(),
        args.context_window.to_string(),
        "--batch-size".to_string(),
        args.batch_size.to_string(),
        "--parallel".to_string(),
        args.parallel_slots.to_string(),
        "--threads".to_string(),
        args.cpu_threads.to_string(),
        "--cache-type-k".to_string(),
        args.kv_cache_quant.as_flag().to_string(),
        "--cache-type-v".to_string(),
        args.kv_cache_quant.as_flag().to_string(),
    ];

    if args.continuous_batching {
        flags.push("--cont-batching".to_string());
    }
    if args.gpu_layers == u32::MAX {
        flags.push("--n-gpu-layers".to_string());
        flags.push("999".to_string());
    } else if args.gpu_layers > 0 {
        flags.push("--n-gpu-layers".to_string());
        flags.push(args.gpu_layers.to_string());
    }
    if args.memory_lock {
        flags.push("--mlock".to_string());
    }
    if args.flash_attention {
        flags.push("--flash-attn".to_string());
    }
    if let Some(projector) = &args.projector_path {
        flags.push("--mmproj".to_string());
        flags.push(projector.clone());
    }
    if let Some(draft) = &args.speculative_draft_model {
        flags.push("--model-draft".to_string());
        flags.push(draft.clone());
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ram_mb: u64, gpu: GpuKind) -> HostInfo {
        HostInfo { total_ram_mb: ram_mb, physical_cores: 8, gpu }
    }

    #[test]
    fn test_small_ram_small_context() {
        let args = compute_worker_args(&host(4096, GpuKind::None), 2048, &Default::default(), None);
        assert_eq!(args.context_window, 2048);
        assert_eq!(args.batch_size, 128);
        assert_eq!(args.kv_cache_quant, KvCacheQuant::Q8_0);
    }

    #[test]
    fn test_mid_ram_large_model_keeps_small_context() {
        let args = compute_worker_args(&host(12 * 1024, GpuKind::None), 5 * 1024, &Default::default(), None);
        assert_eq!(args.context_window, 2048);
    }

    #[test]
    fn test_large_ram_large_context() {
        let args = compute_worker_args(&host(32 * 1024, GpuKind::None), 4096, &Default::default(), None);
        assert_eq!(args.context_window, 8192);
        assert_eq!(args.batch_size, 256);
        assert_eq!(args.kv_cache_quant, KvCacheQuant::F16);
    }

    #[test]
    fn test_no_gpu_means_zero_layers() {
        let args = compute_worker_args(&host(16 * 1024, GpuKind::None), 4096, &Default::default(), None);
        assert_eq!(args.gpu_layers, 0);
        assert!(!args.flash_attention);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let overrides = WorkerArgsOverrides { context_window: Some(1024), ..Default::default() };
        let args = compute_worker_args(&host(32 * 1024, GpuKind::None), 4096, &overrides, None);
        assert_eq!(args.context_window, 1024);
    }

    #[test]
    fn test_cli_flags_include_projector() {
        let args = compute_worker_args(&host(16 * 1024, GpuKind::None), 1024, &Default::default(), Some("/m/proj.bin".to_string()));
        let flags = to_cli_flags(&args, 8300, "/m/model.gguf");
        assert!(flags.iter().any(|f| f == "--mmproj"));
        assert!(flags.iter().any(|f| f == "/m/proj.bin"));
    }
}
