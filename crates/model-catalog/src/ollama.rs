use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// A model served by a user-managed local inference daemon. Discovered at
/// runtime, never curated, never auto-selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalModel {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Probe the conventional Ollama port for installed models. An unreachable
/// daemon is not an error; it just means there is nothing to offer.
pub async fn discover_ollama_models() -> Vec<ExternalModel> {
    match fetch_tags(OLLAMA_BASE_URL).await {
        Ok(models) => models,
        Err(error) => {
            tracing::debug!(%error, "no local inference daemon detected");
            Vec::new()
        }
    }
}

async fn fetch_tags(base_url: &str) -> Result<Vec<ExternalModel>> {
    let url = format!("{base_url}/api/tags");
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(std::time::Duration::from_secs(2))
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;

    let tags: TagsResponse = response
        .json()
        .await
        .context("Failed to parse model list from local daemon")?;

    Ok(tags.models.into_iter().map(external_from_tag).collect())
}

fn external_from_tag(entry: TagEntry) -> ExternalModel {
    ExternalModel {
        id: format!("ollama:{}", entry.name),
        display_name: entry.name,
    }
}

#[cfg(test)]
mod tests {
    use super::{external_from_tag, TagsResponse};

    #[test]
    fn tags_payload_parses_and_maps_to_external_models() {
        let payload = r#"{"models":[{"name":"nomic-embed-text:latest","size":274302450},{"name":"mxbai-embed-large"}]}"#;
        let tags: TagsResponse = serde_json::from_str(payload).expect("tags should parse");

        let models: Vec<_> = tags.models.into_iter().map(external_from_tag).collect();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "ollama:nomic-embed-text:latest");
        assert_eq!(models[1].display_name, "mxbai-embed-large");
    }

    #[test]
    fn empty_payload_yields_no_models() {
        let tags: TagsResponse = serde_json::from_str("{}").expect("empty tags should parse");
        assert!(tags.models.is_empty());
    }
}
