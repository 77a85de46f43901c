use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client as KubeClient};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::label_selector::LabelSelector;
use super::model::{Model, ModelDescriptor};
use crate::config::ChwblConfig;

/// Read access to registered models plus the scale-from-zero nudge.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// `Ok(None)` means no model with that name matches the adapter and selectors.
    async fn lookup_model(
        &self,
        model: &str,
        adapter: &str,
        selectors: &[String],
    ) -> Result<Option<ModelDescriptor>>;

    /// Make sure the model asks for at least one replica. Idempotent.
    async fn scale_at_least_one_replica(&self, model: &str) -> Result<()>;

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;
}

/// Label selectors are AND-combined; a requested adapter must be declared on the model.
fn accepts(descriptor: &ModelDescriptor, adapter: &str, selectors: &[String]) -> Result<bool> {
    if !LabelSelector::matches_all(selectors, &descriptor.labels)? {
        return Ok(false);
    }
    Ok(adapter.is_empty() || descriptor.has_adapter(adapter))
}

/// Models backed by `Model` custom resources in a single namespace.
#[derive(Clone)]
pub struct KubeModelClient {
    api: Api<Model>,
    defaults: ChwblConfig,
}

impl KubeModelClient {
    pub fn new(client: KubeClient, namespace: &str, defaults: ChwblConfig) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            defaults,
        }
    }
}

#[async_trait]
impl ModelClient for KubeModelClient {
    async fn lookup_model(
        &self,
        model: &str,
        adapter: &str,
        selectors: &[String],
    ) -> Result<Option<ModelDescriptor>> {
        let Some(resource) = self
            .api
            .get_opt(model)
            .await
            .with_context(|| format!("get model {model}"))?
        else {
            return Ok(None);
        };

        let descriptor = ModelDescriptor::from_model(&resource, &self.defaults);
        if accepts(&descriptor, adapter, selectors)? {
            Ok(Some(descriptor))
        } else {
            Ok(None)
        }
    }

    async fn scale_at_least_one_replica(&self, model: &str) -> Result<()> {
        let resource = self
            .api
            .get(model)
            .await
            .with_context(|| format!("get scale of model {model}"))?;

        if resource.spec.autoscaling_disabled {
            return Ok(());
        }

        if resource.spec.replicas.unwrap_or(0) == 0 {
            info!("Scaling model {} from zero to one replica", model);
            let patch = serde_json::json!({ "spec": { "replicas": 1 } });
            self.api
                .patch_scale(model, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .with_context(|| format!("update scale of model {model}"))?;
        }

        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let models = self
            .api
            .list(&ListParams::default())
            .await
            .context("list models")?;
        Ok(models
            .items
            .iter()
            .map(|m| ModelDescriptor::from_model(m, &self.defaults))
            .collect())
    }
}

/// In-memory registry. Scale nudges are only counted.
#[derive(Default)]
pub struct StaticModelClient {
    models: RwLock<HashMap<String, ModelDescriptor>>,
    scale_requests: DashMap<String, usize>,
}

impl StaticModelClient {
    pub fn new(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let client = Self::default();
        for model in models {
            client.insert(model);
        }
        client
    }

    pub fn insert(&self, model: ModelDescriptor) {
        self.models.write().insert(model.name.clone(), model);
    }

    pub fn remove(&self, name: &str) -> Option<ModelDescriptor> {
        self.models.write().remove(name)
    }

    /// Number of scale-from-zero nudges received for `model`.
    pub fn scale_requests(&self, model: &str) -> usize {
        self.scale_requests.get(model).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for StaticModelClient {
    async fn lookup_model(
        &self,
        model: &str,
        adapter: &str,
        selectors: &[String],
    ) -> Result<Option<ModelDescriptor>> {
        let Some(descriptor) = self.models.read().get(model).cloned() else {
            return Ok(None);
        };
        if accepts(&descriptor, adapter, selectors)? {
            Ok(Some(descriptor))
        } else {
            Ok(None)
        }
    }

    async fn scale_at_least_one_replica(&self, model: &str) -> Result<()> {
        debug!("Scale nudge for static model {}", model);
        *self.scale_requests.entry(model.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let mut models: Vec<_> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::LoadBalancing;

    fn client() -> StaticModelClient {
        StaticModelClient::new([
            ModelDescriptor::new("m0", LoadBalancing::LeastLoad)
                .with_adapters(["a1", "a2"])
                .with_label("tier", "gold"),
            ModelDescriptor::new("m1", LoadBalancing::LeastLoad),
        ])
    }

    #[tokio::test]
    async fn test_lookup_unknown_model_is_none() {
        assert!(client().lookup_model("nope", "", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_requires_declared_adapter() {
        let c = client();
        assert!(c.lookup_model("m0", "a1", &[]).await.unwrap().is_some());
        assert!(c.lookup_model("m0", "a3", &[]).await.unwrap().is_none());
        assert!(c.lookup_model("m1", "a1", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_applies_selectors() {
        let c = client();
        let gold = vec!["tier=gold".to_string()];
        let silver = vec!["tier in (silver)".to_string()];
        assert!(c.lookup_model("m0", "", &gold).await.unwrap().is_some());
        assert!(c.lookup_model("m0", "", &silver).await.unwrap().is_none());
        assert!(c.lookup_model("m1", "", &gold).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_selector_is_error() {
        let bad = vec!["tier in (gold".to_string()];
        assert!(client().lookup_model("m0", "", &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_scale_requests_are_counted() {
        let c = client();
        c.scale_at_least_one_replica("m0").await.unwrap();
        c.scale_at_least_one_replica("m0").await.unwrap();
        assert_eq!(c.scale_requests("m0"), 2);
        assert_eq!(c.scale_requests("m1"), 0);
    }

    #[tokio::test]
    async fn test_list_models_sorted() {
        let names: Vec<_> = client()
            .list_models()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["m0", "m1"]);
    }
}
