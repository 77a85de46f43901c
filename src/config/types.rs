use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::model::LoadBalancingSpec;
use crate::metrics::PrometheusConfig;

pub const DEFAULT_RETRY_CODES: [u16; 4] = [500, 502, 503, 504];

/// Main dispatcher configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatcherConfig {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body, in bytes
    pub max_payload_size: usize,
    /// Upper bound for a single upstream attempt
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Optional deadline for waiting on an endpoint; waits until cancelled when unset
    #[serde(with = "duration_serde::option")]
    pub await_endpoint_timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_codes: Vec<u16>,
    pub chwbl: ChwblConfig,
    pub messaging: MessagingConfig,
    pub registry: RegistryConfig,
    pub model_servers: ModelServersConfig,
    pub prometheus: Option<PrometheusConfig>,
    pub cors_allowed_origins: Vec<String>,
    pub request_id_headers: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub log_dir: Option<String>,
    pub log_json: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_payload_size: 256 * 1024 * 1024,
            request_timeout: Duration::from_secs(600),
            await_endpoint_timeout: None,
            max_retries: 0,
            retry_codes: DEFAULT_RETRY_CODES.to_vec(),
            chwbl: ChwblConfig::default(),
            messaging: MessagingConfig::default(),
            registry: RegistryConfig::default(),
            model_servers: ModelServersConfig::default(),
            prometheus: None,
            cors_allowed_origins: Vec::new(),
            request_id_headers: None,
            log_level: None,
            log_dir: None,
            log_json: false,
        }
    }
}

/// Defaults applied to CHWBL strategies that leave their knobs unset.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ChwblConfig {
    pub default_replication: u32,
    pub default_mean_load_percentage: u32,
}

impl Default for ChwblConfig {
    fn default() -> Self {
        Self {
            default_replication: 256,
            default_mean_load_percentage: 125,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MessagingConfig {
    #[serde(with = "duration_serde")]
    pub error_max_backoff: Duration,
    pub streams: Vec<MessageStreamConfig>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            error_max_backoff: Duration::from_secs(30),
            streams: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageStreamConfig {
    pub requests_url: String,
    pub responses_url: String,
    #[serde(default = "default_max_handlers")]
    pub max_handlers: usize,
    /// Overrides `messaging.errorMaxBackoff` for this stream
    #[serde(default, with = "duration_serde::option")]
    pub error_max_backoff: Option<Duration>,
}

fn default_max_handlers() -> usize {
    1
}

/// Where model descriptors come from.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RegistryConfig {
    /// `Model` resources in the `modelServers.namespace` namespace
    #[default]
    Kubernetes,
    /// Fixed models with fixed endpoints, no cluster access
    Static { models: Vec<StaticModelConfig> },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct StaticModelConfig {
    pub name: String,
    pub owner: String,
    pub features: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub adapters: Vec<String>,
    pub load_balancing: LoadBalancingSpec,
    /// `host:port` addresses, each serving every adapter listed above
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelServersConfig {
    pub namespace: String,
    /// Honor the address override annotation on model pods (development clusters)
    pub allow_address_override: bool,
}

impl Default for ModelServersConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            allow_address_override: false,
        }
    }
}

/// Durations as humantime strings ("30s", "1m 5s") or integer seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    fn convert<E: de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(&text).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        convert(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(convert)
                .transpose()
        }
    }
}
