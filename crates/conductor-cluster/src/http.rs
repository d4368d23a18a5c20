//! Cluster client for Kubernetes-style REST APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::api::{ClusterApi, ClusterError, ResourceRef};

/// Plural resource names that do not follow the `lowercase(kind) + "s"` rule.
const IRREGULAR_PLURALS: &[(&str, &str)] = &[
    ("Ingress", "ingresses"),
    ("NetworkPolicy", "networkpolicies"),
    ("StorageClass", "storageclasses"),
    ("Endpoints", "endpoints"),
];

/// [`ClusterApi`] over HTTP with optional bearer-token auth.
pub struct HttpCluster {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCluster {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ClusterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Collection URL for a resource, e.g. `/apis/apps/v1/namespaces/ns/deployments`.
    pub fn collection_url(&self, resource: &ResourceRef) -> String {
        let prefix = if resource.api_version.contains('/') {
            format!("apis/{}", resource.api_version)
        } else {
            format!("api/{}", resource.api_version)
        };
        let plural = plural(&resource.kind);
        match &resource.namespace {
            Some(ns) => format!("{}/{}/namespaces/{}/{}", self.base_url, prefix, ns, plural),
            None => format!("{}/{}/{}", self.base_url, prefix, plural),
        }
    }

    pub fn item_url(&self, resource: &ResourceRef) -> String {
        format!("{}/{}", self.collection_url(resource), resource.name)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(
        &self,
        req: RequestBuilder,
        resource: &ResourceRef,
    ) -> Result<Response, ClusterError> {
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound(resource.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClusterError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

fn plural(kind: &str) -> String {
    if let Some((_, p)) = IRREGULAR_PLURALS.iter().find(|(k, _)| *k == kind) {
        return p.to_string();
    }
    let lower = kind.to_lowercase();
    let consonant_y = lower
        .strip_suffix('y')
        .and_then(|stem| stem.chars().last().map(|c| (stem, c)))
        .filter(|(_, c)| !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'));
    if let Some((stem, _)) = consonant_y {
        format!("{}ies", stem)
    } else if lower.ends_with('s') {
        format!("{}es", lower)
    } else {
        format!("{}s", lower)
    }
}

#[async_trait]
impl ClusterApi for HttpCluster {
    async fn is_available(&self) -> bool {
        let url = format!("{}/version", self.base_url);
        match self.authed(self.client.get(&url)).send().await {
            Ok(r) => r.status().is_success(),
            Err(e) => {
                debug!("Cluster API unreachable at {}: {}", url, e);
                false
            }
        }
    }

    async fn read(&self, resource: &ResourceRef) -> Result<Value, ClusterError> {
        let response = self
            .send(self.client.get(self.item_url(resource)), resource)
            .await?;
        response
            .json()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    async fn create(&self, resource: &ResourceRef, body: &Value) -> Result<(), ClusterError> {
        self.send(
            self.client.post(self.collection_url(resource)).json(body),
            resource,
        )
        .await?;
        Ok(())
    }

    async fn patch(&self, resource: &ResourceRef, body: &Value) -> Result<(), ClusterError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ClusterError::Transport(e.to_string()))?;
        self.send(
            self.client
                .patch(self.item_url(resource))
                .header("Content-Type", "application/merge-patch+json")
                .body(payload),
            resource,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ClusterError> {
        self.send(self.client.delete(self.item_url(resource)), resource)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plurals() {
        assert_eq!(plural("Deployment"), "deployments");
        assert_eq!(plural("Ingress"), "ingresses");
        assert_eq!(plural("NetworkPolicy"), "networkpolicies");
        assert_eq!(plural("PersistentVolumeClaim"), "persistentvolumeclaims");
        assert_eq!(plural("Status"), "statuses");
        assert_eq!(plural("Gateway"), "gateways");
        assert_eq!(plural("Key"), "keys");
    }

    #[test]
    fn test_urls() {
        let cluster = HttpCluster::new("https://k8s.local/", None).unwrap();

        let deploy = ResourceRef::new("apps/v1", "Deployment", "web", Some("prod"));
        assert_eq!(
            cluster.item_url(&deploy),
            "https://k8s.local/apis/apps/v1/namespaces/prod/deployments/web"
        );

        let ns = ResourceRef::namespace_ref("prod");
        assert_eq!(
            cluster.collection_url(&ns),
            "https://k8s.local/api/v1/namespaces"
        );

        let crd = ResourceRef::new("example.io/v1", "Widget", "w", Some("prod"));
        assert_eq!(
            cluster.item_url(&crd),
            "https://k8s.local/apis/example.io/v1/namespaces/prod/widgets/w"
        );
    }
}
