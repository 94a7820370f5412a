//! Values composition for a release
//!
//! Values come from two places: `valuesFrom` references to ConfigMaps and
//! Secrets, merged in order, and the inline `values` mapping, merged last so
//! it wins. The composed document is handed to Helm as a values file.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::{HelmRelease, ValuesFromSource};
use crate::Error;

/// Default key looked up in referenced ConfigMaps and Secrets
const DEFAULT_VALUES_KEY: &str = "values.yaml";

/// Reader for `valuesFrom` references
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ValuesClient: Send + Sync {
    /// Fetch the referenced values document. `None` when the reference is
    /// optional and missing.
    async fn values_document(
        &self,
        namespace: &str,
        source: &ValuesFromSource,
    ) -> Result<Option<String>, Error>;
}

/// Values reader backed by the Kubernetes API
pub struct KubeValuesClient {
    client: Client,
}

impl KubeValuesClient {
    /// Create a reader over the given connection
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ValuesClient for KubeValuesClient {
    async fn values_document(
        &self,
        namespace: &str,
        source: &ValuesFromSource,
    ) -> Result<Option<String>, Error> {
        if let Some(selector) = &source.config_map_key_ref {
            let key = selector.key.as_deref().unwrap_or(DEFAULT_VALUES_KEY);
            let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
            let document = api
                .get_opt(&selector.name)
                .await?
                .and_then(|cm| cm.data.as_ref().and_then(|d| d.get(key).cloned()));
            return match document {
                Some(doc) => Ok(Some(doc)),
                None if selector.optional => Ok(None),
                None => Err(Error::invariant(format!(
                    "configmap '{}' has no values under key '{}'",
                    selector.name, key
                ))),
            };
        }

        if let Some(selector) = &source.secret_key_ref {
            let key = selector.key.as_deref().unwrap_or(DEFAULT_VALUES_KEY);
            let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
            let document = api.get_opt(&selector.name).await?.and_then(|secret| {
                secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get(key))
                    .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
            });
            return match document {
                Some(doc) => Ok(Some(doc)),
                None if selector.optional => Ok(None),
                None => Err(Error::invariant(format!(
                    "secret '{}' has no values under key '{}'",
                    selector.name, key
                ))),
            };
        }

        Ok(None)
    }
}

/// Deep-merge `overlay` into `base`; overlay entries win, nested mappings
/// merge recursively
fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Compose the values document of a release: `valuesFrom` in order, inline
/// values last. Returns an empty buffer when nothing is configured.
pub async fn compose_values(
    client: &dyn ValuesClient,
    hr: &HelmRelease,
) -> Result<Vec<u8>, Error> {
    let namespace = hr.namespace().unwrap_or_else(|| "default".to_string());
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    for source in &hr.spec.values_from {
        if let Some(document) = client.values_document(&namespace, source).await? {
            let overlay: serde_json::Value = serde_yaml::from_str(&document)
                .map_err(|e| Error::invariant(format!("invalid values document: {e}")))?;
            merge_values(&mut merged, overlay);
        }
    }

    if let Some(values) = &hr.spec.values {
        let overlay = serde_json::to_value(values)
            .map_err(|e| Error::invariant(format!("invalid inline values: {e}")))?;
        merge_values(&mut merged, overlay);
    }

    let map = match &merged {
        serde_json::Value::Object(map) => map,
        _ => return Ok(Vec::new()),
    };
    if map.is_empty() {
        return Ok(Vec::new());
    }
    let document = serde_yaml::to_string(&merged)
        .map_err(|e| Error::invariant(format!("failed to serialize values: {e}")))?;
    Ok(document.into_bytes())
}
