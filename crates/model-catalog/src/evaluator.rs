use serde::Serialize;

use crate::{
    hardware::HostCapabilities,
    ollama::ExternalModel,
    Catalog, CuratedModel, ModelBackend,
};

// Scoring weights: language fit dominates, benchmark accuracy second, raw
// throughput last. Hardware gates candidates but never contributes points.
const LANGUAGE_POINTS: f32 = 60.0;
const ACCURACY_POINTS: f32 = 32.0;
const SPEED_POINTS: f32 = 8.0;

const GPU_MIN_VRAM_MIB: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Curated models only, scored and sorted; the top entry is recommended.
    Assisted,
    /// Curated models first, then runtime-discovered external-daemon models
    /// with basic info only.
    Manual,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedModel {
    pub id: String,
    pub display_name: String,
    pub dimension: Option<usize>,
    pub score: Option<f32>,
    pub recommended: bool,
    pub curated: bool,
    pub reasons: Vec<String>,
}

/// Gate the curated catalog by hardware, score the survivors, and (in manual
/// mode) append external-daemon models after the curated set.
pub fn recommend(
    catalog: &Catalog,
    capabilities: &HostCapabilities,
    mode: SelectionMode,
    languages: &[String],
    external: &[ExternalModel],
) -> Vec<RankedModel> {
    let compatible: Vec<&CuratedModel> = catalog
        .models()
        .iter()
        .filter(|model| is_hardware_compatible(model, capabilities))
        .collect();

    let max_tokens_per_second = compatible
        .iter()
        .map(|model| model.tokens_per_second)
        .fold(0.0f32, f32::max);

    let mut ranked: Vec<RankedModel> = compatible
        .iter()
        .map(|model| {
            let language = language_fit(model, languages);
            let accuracy = (model.mteb_score / 100.0).clamp(0.0, 1.0);
            let speed = if max_tokens_per_second > 0.0 {
                model.tokens_per_second / max_tokens_per_second
            } else {
                0.0
            };

            let score = language * LANGUAGE_POINTS
                + accuracy * ACCURACY_POINTS
                + speed * SPEED_POINTS;

            RankedModel {
                id: model.id.clone(),
                display_name: model.display_name.clone(),
                dimension: Some(model.dimension),
                score: Some(score),
                recommended: false,
                curated: true,
                reasons: build_reasons(model, capabilities),
            }
        })
        .collect();

    ranked.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.id.cmp(&right.id))
    });

    if let Some(top) = ranked.first_mut() {
        top.recommended = true;
    }

    if mode == SelectionMode::Manual {
        for model in external {
            ranked.push(RankedModel {
                id: model.id.clone(),
                display_name: model.display_name.clone(),
                dimension: None,
                score: None,
                recommended: false,
                curated: false,
                reasons: vec!["served by a local inference daemon".to_string()],
            });
        }
    }

    ranked
}

fn is_hardware_compatible(model: &CuratedModel, capabilities: &HostCapabilities) -> bool {
    match model.backend {
        ModelBackend::Gpu => capabilities.gpu_vram_mib() >= GPU_MIN_VRAM_MIB,
        ModelBackend::Onnx => true,
    }
}

fn language_fit(model: &CuratedModel, languages: &[String]) -> f32 {
    if languages.is_empty() {
        // No preference expressed; fall back to English coverage.
        return model
            .language_scores
            .get("en")
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
    }

    let sum: f32 = languages
        .iter()
        .map(|language| {
            model
                .language_scores
                .get(language.as_str())
                .copied()
                .unwrap_or(0.0)
        })
        .sum();

    (sum / languages.len() as f32).clamp(0.0, 1.0)
}

fn build_reasons(model: &CuratedModel, capabilities: &HostCapabilities) -> Vec<String> {
    let mut reasons = Vec::new();

    match model.backend {
        ModelBackend::Gpu => {
            reasons.push(format!(
                "runs on the {} accelerator ({} MiB device memory)",
                capabilities
                    .gpu
                    .as_ref()
                    .map(|gpu| gpu.vendor.as_str())
                    .unwrap_or("detected"),
                capabilities.gpu_vram_mib()
            ));
        }
        ModelBackend::Onnx => {
            reasons.push(format!(
                "quantized graph fits {}-core CPU hosts",
                capabilities.cpu_cores
            ));
        }
    }

    reasons.push(format!("MTEB score {:.1}", model.mteb_score));
    reasons
}

#[cfg(test)]
mod tests {
    use crate::{
        hardware::{GpuInfo, HostCapabilities},
        ollama::ExternalModel,
        Catalog,
    };

    use super::{recommend, SelectionMode};

    fn cpu_only_host() -> HostCapabilities {
        HostCapabilities {
            cpu_cores: 4,
            cpu_arch: "x86_64".to_string(),
            ram_mib: 8192,
            gpu: None,
        }
    }

    fn gpu_host() -> HostCapabilities {
        HostCapabilities {
            cpu_cores: 16,
            cpu_arch: "x86_64".to_string(),
            ram_mib: 65_536,
            gpu: Some(GpuInfo {
                vendor: "nvidia".to_string(),
                vram_mib: 24_576,
            }),
        }
    }

    #[test]
    fn hosts_without_accelerator_only_see_onnx_models() {
        let catalog = Catalog::load().expect("catalog should load");
        let ranked = recommend(
            &catalog,
            &cpu_only_host(),
            SelectionMode::Assisted,
            &[],
            &[],
        );

        assert!(!ranked.is_empty());
        assert!(ranked.iter().all(|model| model.id.starts_with("cpu:")));
    }

    #[test]
    fn gpu_hosts_see_the_full_catalog_and_top_entry_is_recommended() {
        let catalog = Catalog::load().expect("catalog should load");
        let ranked = recommend(&catalog, &gpu_host(), SelectionMode::Assisted, &[], &[]);

        assert_eq!(ranked.len(), catalog.models().len());
        assert!(ranked[0].recommended);
        assert!(ranked.iter().skip(1).all(|model| !model.recommended));

        // Scores must be non-increasing.
        for pair in ranked.windows(2) {
            assert!(pair[0].score.unwrap() >= pair[1].score.unwrap());
        }
    }

    #[test]
    fn language_preference_shifts_the_ranking() {
        let catalog = Catalog::load().expect("catalog should load");

        let english = recommend(
            &catalog,
            &gpu_host(),
            SelectionMode::Assisted,
            &["en".to_string()],
            &[],
        );
        let korean = recommend(
            &catalog,
            &gpu_host(),
            SelectionMode::Assisted,
            &["ko".to_string()],
            &[],
        );

        // English-only models lose every point of language fit on Korean.
        let english_only_rank = korean
            .iter()
            .position(|model| model.id == "gpu:bge-base-en")
            .expect("english-only model should still be listed");
        let multilingual_rank = korean
            .iter()
            .position(|model| model.id == "gpu:bge-m3")
            .expect("multilingual model should be listed");
        assert!(multilingual_rank < english_only_rank);

        assert!(english
            .iter()
            .all(|model| model.score.unwrap() <= 100.0 + f32::EPSILON));
    }

    #[test]
    fn external_models_only_appear_in_manual_mode_and_never_score() {
        let catalog = Catalog::load().expect("catalog should load");
        let external = vec![ExternalModel {
            id: "ollama:nomic-embed-text".to_string(),
            display_name: "nomic-embed-text".to_string(),
        }];

        let assisted = recommend(
            &catalog,
            &cpu_only_host(),
            SelectionMode::Assisted,
            &[],
            &external,
        );
        assert!(assisted.iter().all(|model| model.curated));

        let manual = recommend(
            &catalog,
            &cpu_only_host(),
            SelectionMode::Manual,
            &[],
            &external,
        );
        let last = manual.last().expect("manual list should not be empty");
        assert_eq!(last.id, "ollama:nomic-embed-text");
        assert!(last.score.is_none());
        assert!(!last.recommended);
    }
}
