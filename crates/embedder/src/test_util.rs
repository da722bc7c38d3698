//! Deterministic embedding backend for tests.
//!
//! Each word hashes to a fixed pseudorandom direction and a text embeds as
//! the normalized sum of its word vectors, so texts sharing words land close
//! together while disjoint texts stay near-orthogonal. The same input always
//! embeds identically across runs and processes, with no model files
//! involved.

pub struct DeterministicEmbedder {
    dimension: usize,
}

impl DeterministicEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed_one(text)).collect()
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for word in words(text) {
            let direction = self.word_direction(&word);
            for (slot, value) in vector.iter_mut().zip(&direction) {
                *slot += value;
            }
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 && norm.is_finite() {
            for value in &mut vector {
                *value /= norm;
            }
        } else {
            vector[0] = 1.0;
        }

        vector
    }

    fn word_direction(&self, word: &str) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(word.as_bytes());
        let mut reader = hasher.finalize_xof();

        let mut bytes = vec![0u8; self.dimension * 4];
        reader.fill(&mut bytes);

        let mut direction: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| {
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map onto [-1, 1); avoids NaN/Inf by construction.
                (raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
            })
            .collect();

        let norm = direction
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();
        if norm > 0.0 {
            for value in &mut direction {
                *value /= norm;
            }
        } else {
            direction[0] = 1.0;
        }

        direction
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|character: char| !character.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
}
