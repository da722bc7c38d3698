use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use embedder::{Capabilities, CpuEmbedder, DaemonEmbedder, Embedder, GpuEmbedder, HardwareClass};
use model_catalog::{Catalog, CuratedModel, HostCapabilities, ModelBackend, SelectionMode};
use model_fetch::{DownloadEvent, DownloadManager, ModelRequest};
use tokio::sync::mpsc;

const EXTERNAL_MODEL_PREFIX: &str = "ollama:";

/// Pick the active model: an explicit configuration wins, otherwise the top
/// assisted recommendation for this host.
pub fn resolve_active_model(
    configured: &str,
    catalog: &Catalog,
    capabilities: &HostCapabilities,
) -> Result<String> {
    if !configured.trim().is_empty() {
        let id = configured.trim();
        if !id.starts_with(EXTERNAL_MODEL_PREFIX) && catalog.find(id).is_none() {
            bail!("model '{id}' is not in the curated catalog; use an 'ollama:' id for external models");
        }
        return Ok(id.to_string());
    }

    let ranked = model_catalog::recommend(catalog, capabilities, SelectionMode::Assisted, &[], &[]);
    ranked
        .into_iter()
        .find(|model| model.recommended)
        .map(|model| model.id)
        .ok_or_else(|| anyhow!("no curated model is compatible with this host"))
}

/// Every file a curated model needs on disk. The first entry is the primary
/// download from the catalog; the rest are companions resolved next to it.
pub fn required_files(model: &CuratedModel) -> Vec<(String, u64)> {
    let mut files = vec![(model.download_url.clone(), model.expected_size)];
    match model.backend {
        ModelBackend::Gpu => {
            files.push((companion_url(&model.download_url, "config.json", false), 0));
            files.push((companion_url(&model.download_url, "tokenizer.json", false), 0));
        }
        ModelBackend::Onnx => {
            files.push((companion_url(&model.download_url, "tokenizer.json", true), 0));
        }
    }
    files
}

/// Rewrite the catalog URL's file name. ONNX graphs live in an `onnx/`
/// subdirectory while their tokenizer sits at the repository root.
fn companion_url(download_url: &str, file_name: &str, strip_onnx_dir: bool) -> String {
    let mut base = match download_url.rsplit_once('/') {
        Some((prefix, _)) => prefix.to_string(),
        None => download_url.to_string(),
    };
    if strip_onnx_dir {
        if let Some(stripped) = base.strip_suffix("/onnx") {
            base = stripped.to_string();
        }
    }
    format!("{base}/{file_name}")
}

/// Make sure every file of the model is in the cache, reporting progress for
/// the given folder. Returns the primary file path.
pub async fn ensure_model_files(
    downloads: &Arc<DownloadManager>,
    model: &CuratedModel,
    folder_id: &str,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<PathBuf> {
    for (url, expected_size) in required_files(model) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        downloads
            .ensure_model(
                ModelRequest {
                    model_id: model.id.clone(),
                    download_url: url.clone(),
                    expected_size,
                },
                folder_id.to_string(),
                tx,
            )
            .await;

        loop {
            match rx.recv().await {
                Some(DownloadEvent::Progress {
                    downloaded_bytes,
                    total_bytes,
                    ..
                }) => on_progress(downloaded_bytes, total_bytes),
                Some(DownloadEvent::Ready { .. }) => break,
                Some(DownloadEvent::Failed { error, .. }) => {
                    bail!("model download failed for {url}: {error}")
                }
                None => bail!("download manager dropped the event channel for {url}"),
            }
        }
    }

    Ok(downloads.model_file_path(&model.id, &model.download_url))
}

/// Build the provider instance the whole daemon shares.
pub async fn build_embedder(
    model_id: &str,
    catalog: &Catalog,
    capabilities: &HostCapabilities,
    downloads: &Arc<DownloadManager>,
) -> Result<Arc<Embedder>> {
    if let Some(name) = model_id.strip_prefix(EXTERNAL_MODEL_PREFIX) {
        let inner = DaemonEmbedder::connect(name)
            .await
            .context("Failed to connect to the local inference daemon")?;
        return Ok(Arc::new(Embedder::daemon(
            model_id,
            Capabilities {
                max_tokens: 2048,
                multilingual: true,
                hardware: HardwareClass::External,
            },
            inner,
        )));
    }

    let model = catalog
        .find(model_id)
        .ok_or_else(|| anyhow!("model '{model_id}' is not in the curated catalog"))?;

    ensure_model_files(downloads, model, "daemon", |_done, _total| {}).await?;
    let primary = downloads.model_file_path(&model.id, &model.download_url);
    let model_dir = primary
        .parent()
        .ok_or_else(|| anyhow!("model path has no parent directory"))?
        .to_path_buf();

    let capabilities_for = |hardware: HardwareClass| Capabilities {
        max_tokens: model.max_tokens,
        multilingual: model.language_scores.len() > 1,
        hardware,
    };

    let embedder = match model.backend {
        ModelBackend::Gpu => {
            let inner = GpuEmbedder::load(&model_dir, model.dimension, model.max_tokens)?;
            Embedder::gpu(model_id, capabilities_for(HardwareClass::Gpu), inner)
        }
        ModelBackend::Onnx => {
            let tokenizer_path = model_dir.join("tokenizer.json");
            let inner = CpuEmbedder::load(
                &primary,
                &tokenizer_path,
                model.dimension,
                model.max_tokens,
                capabilities.cpu_cores,
            )?;
            Embedder::cpu(model_id, capabilities_for(HardwareClass::Cpu), inner)
        }
    };

    Ok(Arc::new(embedder))
}

#[cfg(test)]
mod tests {
    use model_catalog::Catalog;

    use super::{companion_url, required_files, resolve_active_model};

    fn cpu_host() -> model_catalog::HostCapabilities {
        model_catalog::HostCapabilities {
            cpu_cores: 4,
            cpu_arch: "x86_64".to_string(),
            ram_mib: 8192,
            gpu: None,
        }
    }

    #[test]
    fn companion_urls_rewrite_the_file_name() {
        assert_eq!(
            companion_url("https://host/repo/resolve/main/model.safetensors", "config.json", false),
            "https://host/repo/resolve/main/config.json"
        );
        assert_eq!(
            companion_url(
                "https://host/repo/resolve/main/onnx/model_quantized.onnx",
                "tokenizer.json",
                true
            ),
            "https://host/repo/resolve/main/tokenizer.json"
        );
    }

    #[test]
    fn required_files_cover_weights_and_tokenizer() {
        let catalog = Catalog::load().expect("catalog should load");

        let onnx = catalog.find("cpu:all-minilm-l6").expect("onnx model");
        let files = required_files(onnx);
        assert_eq!(files.len(), 2);
        assert!(files[1].0.ends_with("tokenizer.json"));

        let gpu = catalog.find("gpu:bge-m3").expect("gpu model");
        let files = required_files(gpu);
        assert_eq!(files.len(), 3);
        assert!(files.iter().any(|(url, _)| url.ends_with("config.json")));
    }

    #[test]
    fn active_model_resolution_prefers_explicit_configuration() {
        let catalog = Catalog::load().expect("catalog should load");

        let explicit = resolve_active_model("cpu:gte-small", &catalog, &cpu_host())
            .expect("explicit model should resolve");
        assert_eq!(explicit, "cpu:gte-small");

        let external = resolve_active_model("ollama:nomic-embed-text", &catalog, &cpu_host())
            .expect("external model should pass through");
        assert_eq!(external, "ollama:nomic-embed-text");

        assert!(resolve_active_model("gpu:not-real", &catalog, &cpu_host()).is_err());

        let recommended =
            resolve_active_model("", &catalog, &cpu_host()).expect("recommendation should resolve");
        assert!(recommended.starts_with("cpu:"), "cpu host gets an onnx model");
    }
}
