//! Host resource probing: RAM, CPU thread count, and a one-shot GPU presence probe.
//!
//! Feeds the adaptive worker-argument policy (see `worker_args.rs`); none of these values are
//! refreshed per-request, matching the spec's "one-shot probe, never blocks" requirement.

use sysinfo::System;

/// GPU vendor detected on this host, or none. Detection is best-effort: absence of a vendor
/// driver surface is treated as `None` rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuKind {
    None,
    Nvidia,
    Amd,
}

/// Host facts gathered once at startup and held in `AppState`.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub total_ram_mb: u64,
    pub physical_cores: usize,
    pub gpu: GpuKind,
}

impl HostInfo {
    /// Probe the host. `ram_override_mb`, when set, replaces the detected RAM figure — used to
    /// pin a deterministic value for tests and constrained deployments.
    pub fn probe(ram_override_mb: Option<u64>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let total_ram_mb = ram_override_mb.unwrap_or_else(|| sys.total_memory() / (1024 * 1024));
        let physical_cores = System::physical_core_count().unwrap_or(1);
        let gpu = probe_gpu();

        Self { total_ram_mb, physical_cores, gpu }
    }

    /// Free VRAM estimate in MiB, used by the GPU-layer offload heuristic. Returns `None` when
    /// no GPU was detected. This is deliberately coarse: a true per-device query would need
    /// vendor-specific bindings (nvml, rocm-smi) that this crate does not carry.
    pub fn free_vram_mb_estimate(&self) -> Option<u64> {
        match self.gpu {
            GpuKind::None => None,
            // Conservative placeholder: operators running on a GPU host are expected to
            // override this via worker-argument tuning setters once they know their card.
            GpuKind::Nvidia | GpuKind::Amd => Some(8192),
        }
    }

    /// Whether the OS plausibly permits locking pages (`mlock`) of at least `min_mb` MiB.
    /// On Linux, checks the soft `RLIMIT_MEMLOCK`; on every other OS, assumes no limit is
    /// enforced in a way we can usefully probe and returns `false` (locking opts out by
    /// default rather than silently failing after a worker spawn).
    pub fn can_lock_memory(&self, min_mb: u64) -> bool {
        linux_memlock_limit_mb().is_some_and(|limit_mb| limit_mb >= min_mb)
    }
}

/// Reads the soft `Max locked memory` limit from `/proc/self/limits`, avoiding any `unsafe`
/// FFI (this crate forbids `unsafe_code`). The file's column layout is stable across kernels.
#[cfg(target_os = "linux")]
fn linux_memlock_limit_mb() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/limits").ok()?;
    for line in contents.lines() {
        if !line.starts_with("Max locked memory") {
            continue;
        }
        let soft_limit = line.split_whitespace().find(|tok| {
            tok.eq_ignore_ascii_case("unlimited") || tok.chars().all(|c| c.is_ascii_digit())
        })?;
        if soft_limit.eq_ignore_ascii_case("unlimited") {
            return Some(u64::MAX / (1024 * 1024));
        }
        return soft_limit.parse::<u64>().ok().map(|bytes| bytes / (1024 * 1024));
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn linux_memlock_limit_mb() -> Option<u64> {
    None
}

fn probe_gpu() -> GpuKind {
    if std::path::Path::new("/proc/driver/nvidia").exists() || which::which("nvidia-smi").is_ok()
    {
        return GpuKind::Nvidia;
    }
    if which::which("rocm-smi").is_ok() {
        return GpuKind::Amd;
    }
    GpuKind::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_honors_ram_override() {
        let host = HostInfo::probe(Some(4096));
        assert_eq!(host.total_ram_mb, 4096);
    }

    #[test]
    fn test_no_gpu_has_no_free_vram_estimate() {
        let host = HostInfo { total_ram_mb: 8192, physical_cores: 4, gpu: GpuKind::None };
        assert_eq!(host.free_vram_mb_estimate(), None);
    }
}
