use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Pod, Service};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

/// Operations the operator performs on the Kubernetes API.
///
/// Errors are returned as-is, so callers can tell conflicts
/// and missing objects apart.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error>;

    /// Replace the whole service. Fails with a conflict if the
    /// resource version of `svc` is outdated.
    async fn replace_service(&self, svc: &Service) -> Result<Service, kube::Error>;

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<(), kube::Error>;

    /// Merge-patch the metadata of a service.
    async fn patch_service_metadata(
        &self,
        namespace: &str,
        name: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), kube::Error>;

    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error>;
}

#[derive(Clone)]
pub struct KubeApiClient {
    client: Client,
}

impl KubeApiClient {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeApiClient {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error> {
        self.services(namespace).get(name).await
    }

    async fn replace_service(&self, svc: &Service) -> Result<Service, kube::Error> {
        let namespace = svc
            .namespace()
            .unwrap_or_else(|| self.client.default_namespace().to_string());
        self.services(&namespace)
            .replace(&svc.name_any(), &PostParams::default(), svc)
            .await
    }

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LoadBalancerStatus,
    ) -> Result<(), kube::Error> {
        self.services(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({
                    "status": {
                        "loadBalancer": status
                    }
                })),
            )
            .await?;
        Ok(())
    }

    async fn patch_service_metadata(
        &self,
        namespace: &str,
        name: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), kube::Error> {
        self.services(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "metadata": metadata })),
            )
            .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(nodes.items)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&ListParams {
                label_selector: Some(label_selector.to_string()),
                ..Default::default()
            })
            .await?;
        Ok(pods.items)
    }
}
