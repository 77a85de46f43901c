//! `GET /v1/models`: registry listing in the OpenAI model list format.

use serde::{Deserialize, Serialize};

use crate::core::label_selector::LabelSelector;
use crate::core::{ModelClient, ModelDescriptor};
use crate::protocols::request::merge_model_adapter;
use crate::types::DispatchError;

pub const DEFAULT_FEATURE: &str = "TextGeneration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiModel {
    pub id: String,
    pub created: i64,
    pub object: String,
    pub owned_by: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<OpenAiModel>,
}

fn to_openai_model(model: &ModelDescriptor, adapter: &str) -> OpenAiModel {
    OpenAiModel {
        id: merge_model_adapter(&model.name, adapter),
        created: model.created,
        object: "model".to_string(),
        owned_by: model.owner.clone(),
        features: model.features.clone(),
    }
}

/// Models having any of `features` (default `TextGeneration`) and matching
/// every selector. Each adapter is listed as its own `model/adapter` entry.
pub async fn list_models(
    client: &dyn ModelClient,
    features: &[String],
    selectors: &[String],
) -> Result<ModelList, DispatchError> {
    let selectors = selectors
        .iter()
        .map(|s| {
            s.parse::<LabelSelector>().map_err(|e| {
                DispatchError::BadRequest(format!("failed to parse label selector: {e}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let default_features = [DEFAULT_FEATURE.to_string()];
    let features = if features.is_empty() {
        &default_features[..]
    } else {
        features
    };

    let models = client
        .list_models()
        .await
        .map_err(|e| DispatchError::Internal(format!("failed to list models: {e:#}")))?;

    let data = models
        .iter()
        .filter(|m| m.features.iter().any(|f| features.contains(f)))
        .filter(|m| selectors.iter().all(|s| s.matches(&m.labels)))
        .flat_map(|m| {
            std::iter::once(to_openai_model(m, ""))
                .chain(m.adapters.iter().map(|a| to_openai_model(m, a)))
        })
        .collect();

    Ok(ModelList {
        object: "list".to_string(),
        data,
    })
}
