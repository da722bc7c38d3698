use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array2, Axis};
use ort::{GraphOptimizationLevel, Session};
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use crate::{l2_normalize, EmbedError};

/// Quantized-graph inference through ONNX Runtime, tuned for hosts without a
/// usable accelerator.
pub struct CpuEmbedder {
    session: Session,
    tokenizer: Tokenizer,
    dimension: usize,
    needs_token_type_ids: bool,
}

impl CpuEmbedder {
    /// `model_path` points at the quantized `.onnx` graph; `tokenizer_path`
    /// at the matching `tokenizer.json`.
    pub fn load(
        model_path: &Path,
        tokenizer_path: &Path,
        dimension: usize,
        max_tokens: usize,
        intra_threads: usize,
    ) -> Result<Self, EmbedError> {
        for path in [model_path, tokenizer_path] {
            if !path.exists() {
                return Err(EmbedError::ModelFiles(path.display().to_string()));
            }
        }

        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.with_intra_threads(intra_threads.max(1)))
            .and_then(|builder| builder.commit_from_file(model_path))
            .context("Failed to build inference session")?;

        let needs_token_type_ids = session
            .inputs
            .iter()
            .any(|input| input.name == "token_type_ids");

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|error| anyhow!("Failed to load tokenizer: {error}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                ..TruncationParams::default()
            }))
            .map_err(|error| anyhow!("Failed to configure truncation: {error}"))?;

        Ok(Self {
            session,
            tokenizer,
            dimension,
            needs_token_type_ids,
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

        let batch = encodings.len();
        let sequence = encodings
            .iter()
            .map(|encoding| encoding.get_ids().len())
            .max()
            .unwrap_or(0);

        let mut input_ids = Array2::<i64>::zeros((batch, sequence));
        let mut attention_mask = Array2::<i64>::zeros((batch, sequence));
        for (row, encoding) in encodings.iter().enumerate() {
            for (column, id) in encoding.get_ids().iter().enumerate() {
                input_ids[[row, column]] = *id as i64;
            }
            for (column, flag) in encoding.get_attention_mask().iter().enumerate() {
                attention_mask[[row, column]] = *flag as i64;
            }
        }

        let outputs = if self.needs_token_type_ids {
            let token_type_ids = Array2::<i64>::zeros((batch, sequence));
            self.session
                .run(
                    ort::inputs![
                        "input_ids" => input_ids.view(),
                        "attention_mask" => attention_mask.view(),
                        "token_type_ids" => token_type_ids.view(),
                    ]
                    .context("building session inputs")?,
                )
                .context("inference run")?
        } else {
            self.session
                .run(
                    ort::inputs![
                        "input_ids" => input_ids.view(),
                        "attention_mask" => attention_mask.view(),
                    ]
                    .context("building session inputs")?,
                )
                .context("inference run")?
        };

        let hidden = outputs["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .context("reading hidden states")?;
        let hidden = hidden
            .into_dimensionality::<ndarray::Ix3>()
            .context("hidden state shape")?;

        let mut rows = Vec::with_capacity(batch);
        for (row_index, sequence_states) in hidden.axis_iter(Axis(0)).enumerate() {
            let mut pooled = vec![0.0f32; sequence_states.shape()[1]];
            let mut counted = 0.0f32;
            for (position, token_state) in sequence_states.axis_iter(Axis(0)).enumerate() {
                if attention_mask[[row_index, position]] == 0 {
                    continue;
                }
                counted += 1.0;
                for (slot, value) in pooled.iter_mut().zip(token_state.iter()) {
                    *slot += value;
                }
            }

            if counted > 0.0 {
                for slot in &mut pooled {
                    *slot /= counted;
                }
            }

            if pooled.len() != self.dimension {
                return Err(EmbedError::Backend(anyhow!(
                    "model produced {}-dimensional vectors, expected {}",
                    pooled.len(),
                    self.dimension
                )));
            }

            l2_normalize(&mut pooled)?;
            rows.push(pooled);
        }

        Ok(rows)
    }
}
