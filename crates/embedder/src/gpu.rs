use std::path::Path;

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use crate::{l2_normalize, EmbedError};

/// Native transformer inference over candle. Loads a BERT-family encoder from
/// the local model cache and pools token states into one vector per input.
pub struct GpuEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl GpuEmbedder {
    /// `model_dir` must contain `model.safetensors`, `config.json`, and
    /// `tokenizer.json` (the download manager fetches all three).
    pub fn load(model_dir: &Path, dimension: usize, max_tokens: usize) -> Result<Self, EmbedError> {
        let weights_path = model_dir.join("model.safetensors");
        let config_path = model_dir.join("config.json");
        let tokenizer_path = model_dir.join("tokenizer.json");

        for path in [&weights_path, &config_path, &tokenizer_path] {
            if !path.exists() {
                return Err(EmbedError::ModelFiles(path.display().to_string()));
            }
        }

        let device = pick_device();
        tracing::info!(device = ?device, model = %model_dir.display(), "loading transformer");

        let config: Config = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?,
        )
        .context("Failed to parse transformer config")?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.clone()], DTYPE, &device)
                .with_context(|| format!("Failed to map weights at {}", weights_path.display()))?
        };
        let model = BertModel::load(vb, &config).context("Failed to load transformer weights")?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|error| anyhow!("Failed to load tokenizer: {error}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                ..TruncationParams::default()
            }))
            .map_err(|error| anyhow!("Failed to configure truncation: {error}"))?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub(crate) fn embed_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|error| anyhow!("Tokenization failed: {error}"))?;

        let mut id_rows = Vec::with_capacity(encodings.len());
        let mut mask_rows = Vec::with_capacity(encodings.len());
        for encoding in &encodings {
            id_rows.push(Tensor::new(encoding.get_ids(), &self.device).context("token ids")?);
            mask_rows.push(
                Tensor::new(encoding.get_attention_mask(), &self.device)
                    .context("attention mask")?,
            );
        }

        let token_ids = Tensor::stack(&id_rows, 0).context("stack token ids")?;
        let attention_mask = Tensor::stack(&mask_rows, 0).context("stack attention masks")?;
        let token_type_ids = token_ids.zeros_like().context("token type ids")?;

        let hidden = self
            .model
            .forward(&token_ids, &token_type_ids, Some(&attention_mask))
            .context("transformer forward pass")?;

        let pooled = mean_pool(&hidden, &attention_mask)?;
        let mut rows = pooled
            .to_vec2::<f32>()
            .context("reading pooled embeddings")?;

        for row in &mut rows {
            if row.len() != self.dimension {
                return Err(EmbedError::Backend(anyhow!(
                    "model produced {}-dimensional vectors, expected {}",
                    row.len(),
                    self.dimension
                )));
            }
            l2_normalize(row)?;
        }

        Ok(rows)
    }
}

/// Mask-weighted mean over the sequence dimension: `(B, L, H) -> (B, H)`.
fn mean_pool(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask
        .to_dtype(DTYPE)
        .context("mask dtype")?
        .unsqueeze(2)
        .context("mask unsqueeze")?;

    let summed = hidden
        .broadcast_mul(&mask)
        .context("mask multiply")?
        .sum(1)
        .context("sequence sum")?;
    let counts = mask.sum(1).context("mask sum")?.clamp(1e-9, f64::INFINITY)?;

    summed.broadcast_div(&counts).context("mean division")
}

fn pick_device() -> Device {
    if let Ok(device) = Device::new_cuda(0) {
        return device;
    }
    if let Ok(device) = Device::new_metal(0) {
        return device;
    }
    Device::Cpu
}
