//! Embedding providers.
//!
//! One process-wide [`Embedder`] is shared by every folder. The backend is a
//! tagged variant rather than a trait object: the three provenances differ in
//! how vectors are produced, not in what callers may ask of them. All
//! backends preserve input order, L2-normalize their output, and fail fast on
//! an empty batch.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

mod cpu;
mod daemon;
mod gpu;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use cpu::CpuEmbedder;
pub use daemon::DaemonEmbedder;
pub use gpu::GpuEmbedder;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("refusing to embed an empty batch")]
    EmptyBatch,

    #[error("model file missing: {0}")]
    ModelFiles(String),

    #[error("embedding backend failed: {0}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareClass {
    Gpu,
    Cpu,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub max_tokens: usize,
    pub multilingual: bool,
    pub hardware: HardwareClass,
}

enum Backend {
    Gpu(Arc<GpuEmbedder>),
    Cpu(Arc<CpuEmbedder>),
    Daemon(Arc<DaemonEmbedder>),
    #[cfg(any(test, feature = "test-util"))]
    Deterministic(Arc<test_util::DeterministicEmbedder>),
}

pub struct Embedder {
    model_id: String,
    dimension: usize,
    capabilities: Capabilities,
    backend: Backend,
    // One batch in flight at a time; folders share this instance and the
    // backends gain nothing from interleaved inference passes.
    in_flight: tokio::sync::Mutex<()>,
}

impl Embedder {
    pub fn gpu(model_id: &str, capabilities: Capabilities, inner: GpuEmbedder) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension: inner.dimension(),
            capabilities,
            backend: Backend::Gpu(Arc::new(inner)),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cpu(model_id: &str, capabilities: Capabilities, inner: CpuEmbedder) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension: inner.dimension(),
            capabilities,
            backend: Backend::Cpu(Arc::new(inner)),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn daemon(model_id: &str, capabilities: Capabilities, inner: DaemonEmbedder) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension: inner.dimension(),
            capabilities,
            backend: Backend::Daemon(Arc::new(inner)),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn deterministic(model_id: &str, dimension: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension,
            capabilities: Capabilities {
                max_tokens: 512,
                multilingual: false,
                hardware: HardwareClass::Cpu,
            },
            backend: Backend::Deterministic(Arc::new(test_util::DeterministicEmbedder::new(
                dimension,
            ))),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Embed a batch, preserving order. Local backends run on the blocking
    /// pool so an inference pass never stalls the async executor.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Err(EmbedError::EmptyBatch);
        }

        let _serialized = self.in_flight.lock().await;
        let owned: Vec<String> = texts.to_vec();
        match &self.backend {
            Backend::Gpu(inner) => {
                let inner = Arc::clone(inner);
                tokio::task::spawn_blocking(move || inner.embed_blocking(&owned))
                    .await
                    .map_err(|error| EmbedError::Backend(anyhow::anyhow!(error)))?
            }
            Backend::Cpu(inner) => {
                let inner = Arc::clone(inner);
                tokio::task::spawn_blocking(move || inner.embed_blocking(&owned))
                    .await
                    .map_err(|error| EmbedError::Backend(anyhow::anyhow!(error)))?
            }
            Backend::Daemon(inner) => inner.embed(&owned).await,
            #[cfg(any(test, feature = "test-util"))]
            Backend::Deterministic(inner) => Ok(inner.embed(&owned)),
        }
    }
}

/// Scale a vector to unit length in place. Zero or non-finite vectors are
/// rejected because cosine similarity over them is meaningless.
pub(crate) fn l2_normalize(values: &mut [f32]) -> Result<(), anyhow::Error> {
    let norm = values.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(anyhow::anyhow!(
            "embedding vector norm must be finite and non-zero for normalization"
        ));
    }

    for value in values {
        *value /= norm;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{l2_normalize, Embedder, EmbedError};

    #[test]
    fn l2_normalize_produces_unit_vectors() {
        let mut values = vec![3.0, 4.0];
        l2_normalize(&mut values).expect("normalization should succeed");
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_rejects_zero_vectors() {
        let mut values = vec![0.0, 0.0];
        assert!(l2_normalize(&mut values).is_err());
    }

    #[tokio::test]
    async fn empty_batch_fails_fast() {
        let embedder = Embedder::deterministic("test-model", 16);
        let result = embedder.embed(&[]).await;
        assert!(matches!(result, Err(EmbedError::EmptyBatch)));
    }

    #[tokio::test]
    async fn deterministic_backend_is_stable_ordered_and_normalized() {
        let embedder = Embedder::deterministic("test-model", 16);

        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let first = embedder.embed(&texts).await.expect("embed should succeed");
        let second = embedder.embed(&texts).await.expect("embed should succeed");

        assert_eq!(first, second, "same input must embed identically");
        assert_ne!(first[0], first[1], "different texts should differ");

        for vector in &first {
            assert_eq!(vector.len(), 16);
            let norm: f32 = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3);
        }
    }
}
