pub mod types;

pub use types::*;

use std::path::Path;

use crate::types::ConfigurationError;

impl DispatcherConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ConfigurationError(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.chwbl.default_replication == 0 {
            return Err(ConfigurationError(
                "chwbl.defaultReplication must be greater than zero".to_string(),
            ));
        }
        if self.chwbl.default_mean_load_percentage == 0 {
            return Err(ConfigurationError(
                "chwbl.defaultMeanLoadPercentage must be greater than zero".to_string(),
            ));
        }
        if let Some(code) = self.retry_codes.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(ConfigurationError(format!(
                "retryCodes contains invalid status code {code}"
            )));
        }
        for (i, stream) in self.messaging.streams.iter().enumerate() {
            if stream.requests_url.is_empty() || stream.responses_url.is_empty() {
                return Err(ConfigurationError(format!(
                    "messaging.streams[{i}] requires requestsUrl and responsesUrl"
                )));
            }
            if stream.max_handlers == 0 {
                return Err(ConfigurationError(format!(
                    "messaging.streams[{i}].maxHandlers must be greater than zero"
                )));
            }
        }
        if let RegistryConfig::Static { models } = &self.registry {
            if let Some(model) = models.iter().find(|m| m.name.is_empty()) {
                return Err(ConfigurationError(format!(
                    "static model with endpoints {:?} has no name",
                    model.endpoints
                )));
            }
        }
        Ok(())
    }
}
