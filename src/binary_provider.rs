//! Binary Provider (C1).
//!
//! Resolves the path to the worker executable: an operator override, a local install
//! directory, the system `PATH`, or — failing all three — a fetch-and-extract of a pinned
//! remote archive keyed by `(os, arch, gpu)`. Grounded on the teacher's `core/http_client.rs`
//! fetch idiom (a shared `reqwest::Client`, `.error_for_status()`, streamed body) generalized
//! from JSON API calls to a binary archive download.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::OrchestratorError;
use crate::host::GpuKind;

const WORKER_BINARY_NAME: &str = "orchd-worker";

/// `(os, arch, gpu)` key used to select the archive to fetch.
#[derive(Debug, Clone)]
struct ArchiveKey {
    os: &'static str,
    arch: &'static str,
    gpu: &'static str,
}

impl ArchiveKey {
    fn detect(gpu: GpuKind) -> Result<Self, OrchestratorError> {
        let os = if cfg!(target_os = "linux") {
            "linux"
        } else if cfg!(target_os = "macos") {
            "macos"
        } else {
            return Err(OrchestratorError::BinaryUnavailable {
                message: format!("unsupported OS for worker binary: {}", std::env::consts::OS),
                transient: false,
            });
        };

        let arch = if cfg!(target_arch = "x86_64") {
            "x86_64"
        } else if cfg!(target_arch = "aarch64") {
            "aarch64"
        } else {
            return Err(OrchestratorError::BinaryUnavailable {
                message: format!("unsupported architecture for worker binary: {}", std::env::consts::ARCH),
                transient: false,
            });
        };

        let gpu = match gpu {
            GpuKind::None => "cpu",
            GpuKind::Nvidia => "cuda",
            GpuKind::Amd => "rocm",
        };

        Ok(Self { os, arch, gpu })
    }

    fn archive_name(&self) -> String {
        format!("{WORKER_BINARY_NAME}-{}-{}-{}.zip", self.os, self.arch, self.gpu)
    }
}

/// Base URL for the pinned release archive. Overridable via `ORCHD_WORKER_BINARY_BASE_URL` for
/// air-gapped mirrors.
fn archive_base_url() -> String {
    std::env::var("ORCHD_WORKER_BINARY_BASE_URL")
        .unwrap_or_else(|_| "https://distribution.invalid/orchd-worker/releases".to_string())
}

/// Locates, or fetches, the worker binary. Constructed once and held in `AppState`.
pub struct BinaryProvider {
    override_path: Option<PathBuf>,
    install_dir: PathBuf,
    http: reqwest::Client,
}

impl BinaryProvider {
    pub fn new(override_path: Option<PathBuf>, install_dir: PathBuf, http: reqwest::Client) -> Self {
        Self { override_path, install_dir, http }
    }

    /// Resolution order: override path, local install dir, system `PATH`, then fetch.
    pub async fn locate_binary(&self, gpu: GpuKind) -> Result<PathBuf, OrchestratorError> {
        if let Some(path) = &self.override_path {
            if tokio::fs::metadata(path).await.is_ok() {
                return Ok(path.clone());
            }
            warn!(path = %path.display(), "configured worker binary override does not exist");
        }

        let local = self.install_dir.join(WORKER_BINARY_NAME);
        if tokio::fs::metadata(&local).await.is_ok() {
            return Ok(local);
        }

        if let Ok(found) = which::which(WORKER_BINARY_NAME) {
            return Ok(found);
        }

        self.fetch_and_extract(gpu).await
    }

    async fn fetch_and_extract(&self, gpu: GpuKind) -> Result<PathBuf, OrchestratorError> {
        let key = ArchiveKey::detect(gpu)?;
        let url = format!("{}/{}", archive_base_url(), key.archive_name());

        info!(url, "fetching worker binary archive");

        let response = self.http.get(&url).send().await.map_err(|e| {
            OrchestratorError::BinaryUnavailable { message: e.to_string(), transient: true }
        })?;

        let response = response.error_for_status().map_err(|e| {
            let transient = e.status().map(|s| s.is_server_error()).unwrap_or(true);
            OrchestratorError::BinaryUnavailable { message: e.to_string(), transient }
        })?;

        let bytes = response.bytes().await.map_err(|e| OrchestratorError::BinaryUnavailable {
            message: e.to_string(),
            transient: true,
        })?;

        tokio::fs::create_dir_all(&self.install_dir).await.map_err(|e| {
            OrchestratorError::BinaryUnavailable { message: e.to_string(), transient: false }
        })?;

        // Partial downloads are discarded, not resumed: extraction happens from the fully
        // buffered response body, never from a partially written file on disk.
        let install_dir = self.install_dir.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_archive(&bytes, &install_dir))
            .await
            .map_err(|e| OrchestratorError::BinaryUnavailable { message: e.to_string(), transient: false })?
            .map_err(|e| OrchestratorError::BinaryUnavailable { message: e.to_string(), transient: false })?;

        Ok(extracted)
    }
}

fn extract_archive(bytes: &[u8], install_dir: &Path) -> anyhow::Result<PathBuf> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name() else { continue };
        let out_path = install_dir.join(name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&out_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&out_path, perms)?;
        }
    }

    let binary_path = install_dir.join(WORKER_BINARY_NAME);
    if !binary_path.exists() {
        anyhow::bail!("extracted archive did not contain {WORKER_BINARY_NAME}");
    }
    Ok(binary_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_key_names_current_platform() {
        let key = ArchiveKey::detect(GpuKind::None).expect("supported in CI");
        assert!(key.archive_name().starts_with(WORKER_BINARY_NAME));
        assert!(key.archive_name().ends_with(".zip"));
    }

    #[tokio::test]
    async fn test_override_path_wins_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let override_path = dir.path().join("custom-worker");
        std::fs::write(&override_path, b"#!/bin/sh\n").unwrap();

        let provider = BinaryProvider::new(
            Some(override_path.clone()),
            dir.path().join("installed"),
            reqwest::Client::new(),
        );

        let resolved = provider.locate_binary(GpuKind::None).await.unwrap();
        assert_eq!(resolved, override_path);
    }

    #[tokio::test]
    async fn test_local_install_dir_wins_over_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let install_dir = dir.path().join("installed");
        std::fs::create_dir_all(&install_dir).unwrap();
        std::fs::write(install_dir.join(WORKER_BINARY_NAME), b"#!/bin/sh\n").unwrap();

        let provider = BinaryProvider::new(None, install_dir.clone(), reqwest::Client::new());
        let resolved = provider.locate_binary(GpuKind::None).await.unwrap();
        assert_eq!(resolved, install_dir.join(WORKER_BINARY_NAME));
    }
}
