use anyhow::{anyhow, Context};
use ollama_rs::{generation::embeddings::request::GenerateEmbeddingsRequest, Ollama};

use crate::{l2_normalize, EmbedError};

/// Embeddings served by a user-managed local inference daemon (Ollama at its
/// conventional port).
pub struct DaemonEmbedder {
    client: Ollama,
    model: String,
    dimension: usize,
}

impl DaemonEmbedder {
    /// Connect to the daemon and probe the model's dimension with a one-off
    /// embedding request.
    pub async fn connect(model: &str) -> Result<Self, EmbedError> {
        if model.trim().is_empty() {
            return Err(EmbedError::Backend(anyhow!(
                "daemon model name must be provided"
            )));
        }

        let client = Ollama::default();
        let probe = request_embeddings(&client, model, vec!["dimension probe".to_string()]).await?;
        let dimension = probe
            .first()
            .map(|vector| vector.len())
            .filter(|length| *length > 0)
            .ok_or_else(|| {
                EmbedError::Backend(anyhow!(
                    "daemon returned an empty embedding for model '{model}'"
                ))
            })?;

        tracing::info!(model, dimension, "connected to local inference daemon");

        Ok(Self {
            client,
            model: model.to_string(),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub(crate) async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut vectors = request_embeddings(&self.client, &self.model, texts.to_vec()).await?;
        if vectors.len() != texts.len() {
            return Err(EmbedError::Backend(anyhow!(
                "daemon returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }

        for vector in &mut vectors {
            if vector.len() != self.dimension {
                return Err(EmbedError::Backend(anyhow!(
                    "daemon returned a {}-dimensional embedding, expected {}",
                    vector.len(),
                    self.dimension
                )));
            }
            l2_normalize(vector)?;
        }

        Ok(vectors)
    }
}

async fn request_embeddings(
    client: &Ollama,
    model: &str,
    texts: Vec<String>,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let request = GenerateEmbeddingsRequest::new(model.to_string(), texts.into());
    let response = client
        .generate_embeddings(request)
        .await
        .context("Failed to generate embeddings with the local daemon")?;

    Ok(response.embeddings)
}
