//! `Model` custom resource and the routing view derived from it.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::config::{ChwblConfig, StaticModelConfig};

pub const DEFAULT_PREFIX_CHAR_LENGTH: usize = 100;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "kubeai.org",
    version = "v1",
    kind = "Model",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub min_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default)]
    pub autoscaling_disabled: bool,
    #[serde(default)]
    pub load_balancing: LoadBalancingSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AdapterSpec {
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
pub enum Strategy {
    #[default]
    LeastLoad,
    PrefixHash,
    RoutingKey,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancingSpec {
    pub strategy: Strategy,
    pub prefix_hash: PrefixHashSpec,
    pub routing_key: RoutingKeySpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PrefixHashSpec {
    pub mean_load_percentage: Option<u32>,
    pub replication: Option<u32>,
    pub prefix_char_length: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingKeySpec {
    pub mean_load_percentage: Option<u32>,
    pub replication: Option<u32>,
    pub fallback_to_least_load: bool,
}

/// Per-model load balancing policy with all defaults applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LoadBalancing {
    #[default]
    LeastLoad,
    PrefixHash {
        mean_load_percentage: u32,
        replication: u32,
        prefix_char_length: usize,
    },
    RoutingKey {
        mean_load_percentage: u32,
        replication: u32,
        fallback_to_least_load: bool,
    },
}

impl LoadBalancing {
    pub fn strategy(&self) -> Strategy {
        match self {
            LoadBalancing::LeastLoad => Strategy::LeastLoad,
            LoadBalancing::PrefixHash { .. } => Strategy::PrefixHash,
            LoadBalancing::RoutingKey { .. } => Strategy::RoutingKey,
        }
    }

    /// Virtual points per endpoint on the hash ring, when the policy uses one.
    pub fn replication(&self) -> Option<u32> {
        match self {
            LoadBalancing::LeastLoad => None,
            LoadBalancing::PrefixHash { replication, .. }
            | LoadBalancing::RoutingKey { replication, .. } => Some(*replication),
        }
    }
}

impl LoadBalancingSpec {
    pub fn resolve(&self, defaults: &ChwblConfig) -> LoadBalancing {
        match self.strategy {
            Strategy::LeastLoad => LoadBalancing::LeastLoad,
            Strategy::PrefixHash => LoadBalancing::PrefixHash {
                mean_load_percentage: self
                    .prefix_hash
                    .mean_load_percentage
                    .unwrap_or(defaults.default_mean_load_percentage),
                replication: self
                    .prefix_hash
                    .replication
                    .unwrap_or(defaults.default_replication),
                prefix_char_length: self
                    .prefix_hash
                    .prefix_char_length
                    .unwrap_or(DEFAULT_PREFIX_CHAR_LENGTH),
            },
            Strategy::RoutingKey => LoadBalancing::RoutingKey {
                mean_load_percentage: self
                    .routing_key
                    .mean_load_percentage
                    .unwrap_or(defaults.default_mean_load_percentage),
                replication: self
                    .routing_key
                    .replication
                    .unwrap_or(defaults.default_replication),
                fallback_to_least_load: self.routing_key.fallback_to_least_load,
            },
        }
    }
}

/// What the dispatcher needs to know about a registered model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub owner: String,
    pub features: Vec<String>,
    pub adapters: Vec<String>,
    pub load_balancing: LoadBalancing,
    /// Creation time, unix seconds
    pub created: i64,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, load_balancing: LoadBalancing) -> Self {
        Self {
            name: name.into(),
            load_balancing,
            ..Default::default()
        }
    }

    pub fn with_adapters<I, S>(mut self, adapters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.adapters = adapters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_adapter(&self, adapter: &str) -> bool {
        self.adapters.iter().any(|a| a == adapter)
    }

    pub fn from_model(model: &Model, defaults: &ChwblConfig) -> Self {
        let created = model
            .metadata
            .creation_timestamp
            .as_ref()
            .and_then(|t| serde_json::to_value(t).ok())
            .and_then(|v| {
                v.as_str()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            })
            .map(|t| t.timestamp())
            .unwrap_or_default();
        Self {
            name: model.metadata.name.clone().unwrap_or_default(),
            labels: model.metadata.labels.clone().unwrap_or_default(),
            owner: model.spec.owner.clone(),
            features: model.spec.features.clone(),
            adapters: model.spec.adapters.iter().map(|a| a.name.clone()).collect(),
            load_balancing: model.spec.load_balancing.resolve(defaults),
            created,
        }
    }

    pub fn from_static(model: &StaticModelConfig, defaults: &ChwblConfig) -> Self {
        Self {
            name: model.name.clone(),
            labels: model.labels.clone(),
            owner: model.owner.clone(),
            features: model.features.clone(),
            adapters: model.adapters.clone(),
            load_balancing: model.load_balancing.resolve(defaults),
            created: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_applies_defaults() {
        let spec: LoadBalancingSpec =
            serde_json::from_str(r#"{"strategy": "PrefixHash", "prefixHash": {"replication": 16}}"#)
                .unwrap();
        assert_eq!(
            spec.resolve(&ChwblConfig::default()),
            LoadBalancing::PrefixHash {
                mean_load_percentage: 125,
                replication: 16,
                prefix_char_length: DEFAULT_PREFIX_CHAR_LENGTH,
            }
        );
    }

    #[test]
    fn test_resolve_routing_key() {
        let spec: LoadBalancingSpec = serde_json::from_str(
            r#"{"strategy": "RoutingKey", "routingKey": {"fallbackToLeastLoad": true}}"#,
        )
        .unwrap();
        let resolved = spec.resolve(&ChwblConfig::default());
        assert_eq!(resolved.strategy(), Strategy::RoutingKey);
        assert_eq!(resolved.replication(), Some(256));
        assert!(matches!(
            resolved,
            LoadBalancing::RoutingKey {
                fallback_to_least_load: true,
                ..
            }
        ));
    }

    #[test]
    fn test_model_resource_parses() {
        let json = serde_json::json!({
            "apiVersion": "kubeai.org/v1",
            "kind": "Model",
            "metadata": {"name": "llama", "namespace": "default", "labels": {"tier": "gold"}},
            "spec": {
                "url": "hf://meta/llama",
                "engine": "VLLM",
                "features": ["TextGeneration"],
                "adapters": [{"name": "sql", "url": "hf://x/sql"}],
                "loadBalancing": {"strategy": "LeastLoad"}
            }
        });
        let model: Model = serde_json::from_value(json).unwrap();
        let descriptor = ModelDescriptor::from_model(&model, &ChwblConfig::default());
        assert_eq!(descriptor.name, "llama");
        assert!(descriptor.has_adapter("sql"));
        assert_eq!(descriptor.labels.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(descriptor.load_balancing, LoadBalancing::LeastLoad);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("PrefixHash".parse::<Strategy>().unwrap(), Strategy::PrefixHash);
        assert_eq!(Strategy::RoutingKey.to_string(), "RoutingKey");
    }
}
