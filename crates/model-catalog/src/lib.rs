//! Curated model catalog, host capability detection, and the model
//! recommendation pipeline.
//!
//! The catalog is a static JSON asset compiled into the binary. Hardware
//! detection runs at most once per hour; the result is cached on disk so
//! repeated daemon commands do not re-probe the host. External-daemon models
//! (Ollama) are discovered at runtime and only ever surface in manual mode,
//! unscored.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

mod evaluator;
mod hardware;
mod ollama;

pub use evaluator::{recommend, RankedModel, SelectionMode};
pub use hardware::{detect_capabilities, GpuInfo, HostCapabilities};
pub use ollama::{discover_ollama_models, ExternalModel};

static CURATED_MODELS_JSON: &str = include_str!("../assets/curated-models.json");

/// Which backend family a curated model runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelBackend {
    Gpu,
    Onnx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuratedModel {
    pub id: String,
    pub display_name: String,
    pub dimension: usize,
    pub max_tokens: usize,
    pub download_url: String,
    pub expected_size: u64,
    pub mteb_score: f32,
    pub tokens_per_second: f32,
    pub language_scores: HashMap<String, f32>,
    #[serde(skip, default = "default_backend")]
    pub backend: ModelBackend,
}

fn default_backend() -> ModelBackend {
    ModelBackend::Onnx
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    gpu_models: Vec<CuratedModel>,
    onnx_models: Vec<CuratedModel>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    models: Vec<CuratedModel>,
}

impl Catalog {
    /// Parse the embedded catalog asset.
    pub fn load() -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(CURATED_MODELS_JSON)
            .context("Failed to parse embedded curated models catalog")?;

        let mut models = Vec::with_capacity(file.gpu_models.len() + file.onnx_models.len());
        for mut model in file.gpu_models {
            model.backend = ModelBackend::Gpu;
            models.push(model);
        }
        for mut model in file.onnx_models {
            model.backend = ModelBackend::Onnx;
            models.push(model);
        }

        Ok(Self { models })
    }

    pub fn models(&self) -> &[CuratedModel] {
        &self.models
    }

    pub fn find(&self, model_id: &str) -> Option<&CuratedModel> {
        self.models.iter().find(|model| model.id == model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Catalog, ModelBackend};

    #[test]
    fn embedded_catalog_parses_and_tags_backends() {
        let catalog = Catalog::load().expect("embedded catalog should parse");
        assert!(!catalog.models().is_empty());

        let gpu_count = catalog
            .models()
            .iter()
            .filter(|model| model.backend == ModelBackend::Gpu)
            .count();
        let onnx_count = catalog
            .models()
            .iter()
            .filter(|model| model.backend == ModelBackend::Onnx)
            .count();
        assert!(gpu_count > 0, "catalog should carry gpu models");
        assert!(onnx_count > 0, "catalog should carry onnx models");
    }

    #[test]
    fn models_carry_download_urls_and_dimensions() {
        let catalog = Catalog::load().expect("embedded catalog should parse");
        for model in catalog.models() {
            assert!(model.download_url.starts_with("https://"), "{}", model.id);
            assert!(model.dimension > 0, "{}", model.id);
            assert!(model.max_tokens > 0, "{}", model.id);
        }
    }

    #[test]
    fn find_resolves_known_ids() {
        let catalog = Catalog::load().expect("embedded catalog should parse");
        assert!(catalog.find("cpu:all-minilm-l6").is_some());
        assert!(catalog.find("made-up-model").is_none());
    }
}
