//! Local model catalog.
//!
//! Model discovery and download from remote catalogs is explicitly out of scope; this module
//! only catalogs `.gguf`/`.safetensors`/`.bin` files already present under the configured model
//! directory, deriving an id from the filename stem. Shape mirrors the teacher's
//! `get_supported_models`/`filter_models`/`ModelInfo` listing idiom, generalized from a static
//! hardcoded registry to a filesystem scan.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const MODEL_EXTENSIONS: &[&str] = &["gguf", "safetensors", "bin"];

/// A model file discovered under the model directory.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    /// Model identifier: the filename stem, used as the id workers and the cache key on.
    pub id: String,
    /// Absolute path to the model file.
    pub path: String,
    /// File size in megabytes.
    pub size_mb: u64,
    /// Optional sibling multimodal projector file (`<id>.mmproj.*`), if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projector_path: Option<String>,
}

/// OpenAI-compatible `/v1/models` entry shape.
#[derive(Debug, Serialize, ToSchema)]
pub struct OpenAiModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

impl From<&ModelInfo> for OpenAiModelEntry {
    fn from(info: &ModelInfo) -> Self {
        Self { id: info.id.clone(), object: "model", owned_by: "local" }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListModelsResponse {
    pub object: &'static str,
    pub data: Vec<OpenAiModelEntry>,
}

/// Scan `dir` for model files, skipping projector sidecars (matched by the `.mmproj.` infix)
/// and pairing each model with its projector when one exists alongside it.
pub async fn discover_catalog(dir: &Path) -> anyhow::Result<Vec<ModelInfo>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates: Vec<PathBuf> = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else { continue };
        if MODEL_EXTENSIONS.contains(&ext) {
            candidates.push(path);
        }
    }

    let mut models = Vec::new();
    for path in &candidates {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if file_name.contains(".mmproj.") {
            continue;
        }

        let id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        let metadata = tokio::fs::metadata(path).await?;
        let size_mb = (metadata.len() / (1024 * 1024)).max(1);

        let projector_path = candidates
            .iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&format!("{id}.mmproj.")))
                    .unwrap_or(false)
            })
            .map(|p| p.to_string_lossy().to_string());

        models.push(ModelInfo { id, path: path.to_string_lossy().to_string(), size_mb, projector_path });
    }

    models.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(models)
}

/// Filter a catalog down to an allow-list of ids; an empty list means "no restriction".
pub fn filter_models(all_models: Vec<ModelInfo>, allowed_ids: &[String]) -> Vec<ModelInfo> {
    if allowed_ids.is_empty() {
        return all_models;
    }
    all_models.into_iter().filter(|m| allowed_ids.contains(&m.id)).collect()
}

pub fn to_openai_listing(models: &[ModelInfo]) -> ListModelsResponse {
    ListModelsResponse { object: "list", data: models.iter().map(OpenAiModelEntry::from).collect() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_catalog_finds_gguf_and_pairs_projector() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("llava-7b.gguf"), b"fake").unwrap();
        std::fs::write(dir.path().join("llava-7b.mmproj.gguf"), b"fake-proj").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let catalog = discover_catalog(dir.path()).await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].id, "llava-7b");
        assert!(catalog[0].projector_path.is_some());
    }

    #[test]
    fn test_filter_models_empty_allowlist_passes_through() {
        let models = vec![ModelInfo { id: "a".into(), path: "/a".into(), size_mb: 1, projector_path: None }];
        let filtered = filter_models(models.clone(), &[]);
        assert_eq!(filtered.len(), models.len());
    }

    #[test]
    fn test_filter_models_restricts_to_allowlist() {
        let models = vec![
            ModelInfo { id: "a".into(), path: "/a".into(), size_mb: 1, projector_path: None },
            ModelInfo { id: "b".into(), path: "/b".into(), size_mb: 1, projector_path: None },
        ];
        let filtered = filter_models(models, &["b".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "b");
    }

    #[test]
    fn test_openai_listing_shape() {
        let models = vec![ModelInfo { id: "m".into(), path: "/m".into(), size_mb: 1, projector_path: None }];
        let listing = to_openai_listing(&models);
        assert_eq!(listing.object, "list");
        assert_eq!(listing.data[0].id, "m");
    }
}
