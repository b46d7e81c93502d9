//! Cluster API access for the reconciler
//!
//! Every Kubernetes operation the reconciler performs goes through the
//! [`RayApi`] trait so tests can substitute a mock; [`KubeRayApi`] is the
//! real implementation over a `kube::Client`. Optimistic concurrency is the
//! API server's: conflicting writes surface as retryable errors and the next
//! tick re-reads.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::{RayCluster, RayService};
use crate::error::Error;
use crate::{
    RAY_CLUSTER_LABEL_KEY, RAY_NODE_TYPE_HEAD, RAY_NODE_TYPE_LABEL_KEY,
    RAY_ORIGINATED_FROM_CRD_LABEL_KEY, RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY,
    RAY_ORIGINATED_FROM_RAY_SERVICE,
};

/// Kubernetes operations consumed by the RayService reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RayApi: Send + Sync {
    /// Fetch a RayService; `None` when it no longer exists
    async fn get_ray_service(&self, namespace: &str, name: &str)
        -> Result<Option<RayService>, Error>;

    /// Write the RayService status subresource (replace semantics)
    async fn update_ray_service_status(&self, ray_service: &RayService) -> Result<(), Error>;

    /// Publish a Warning event on the RayService
    async fn publish_warning_event(
        &self,
        ray_service: &RayService,
        reason: &str,
        message: &str,
    ) -> Result<(), Error>;

    /// Fetch a RayCluster; `None` when it does not exist
    async fn get_ray_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<RayCluster>, Error>;

    /// List all RayClusters originated from the given RayService
    async fn list_ray_clusters_owned_by(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<RayCluster>, Error>;

    /// Create a RayCluster
    async fn create_ray_cluster(&self, cluster: &RayCluster) -> Result<(), Error>;

    /// Replace a RayCluster's spec and metadata
    async fn update_ray_cluster(&self, cluster: &RayCluster) -> Result<(), Error>;

    /// Delete a RayCluster with background propagation
    async fn delete_ray_cluster(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a Service; `None` when it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<(), Error>;

    /// Replace a Service's spec
    async fn update_service(&self, service: &Service) -> Result<(), Error>;

    /// Fetch the Endpoints object backing a Service
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error>;

    /// Fetch the head pod of a RayCluster; `None` when no head pod exists
    async fn get_head_pod(&self, namespace: &str, cluster_name: &str)
        -> Result<Option<Pod>, Error>;

    /// Replace a Pod (label updates)
    async fn update_pod(&self, pod: &Pod) -> Result<(), Error>;
}

/// Real [`RayApi`] over a `kube::Client`
pub struct KubeRayApi {
    client: Client,
    reporter: Reporter,
}

impl KubeRayApi {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: "rayservice-operator".into(),
                instance: None,
            },
        }
    }

    fn ray_services(&self, namespace: &str) -> Api<RayService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn ray_clusters(&self, namespace: &str) -> Api<RayCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespace_of<K: ResourceExt>(object: &K) -> String {
        object.namespace().unwrap_or_else(|| "default".to_string())
    }
}

#[async_trait]
impl RayApi for KubeRayApi {
    async fn get_ray_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RayService>, Error> {
        Ok(self.ray_services(namespace).get_opt(name).await?)
    }

    async fn update_ray_service_status(&self, ray_service: &RayService) -> Result<(), Error> {
        let namespace = Self::namespace_of(ray_service);
        let name = ray_service.name_any();
        let data = serde_json::to_vec(ray_service)
            .map_err(|e| Error::serialization(format!("failed to serialize RayService: {e}")))?;
        // Replace rather than merge so cleared slots and removed application
        // keys actually disappear from the stored status.
        self.ray_services(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?;
        Ok(())
    }

    async fn publish_warning_event(
        &self,
        ray_service: &RayService,
        reason: &str,
        message: &str,
    ) -> Result<(), Error> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let reference = ray_service.object_ref(&());
        recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.to_string(),
                    note: Some(message.to_string()),
                    action: "ValidatingSpec".to_string(),
                    secondary: None,
                },
                &reference,
            )
            .await?;
        Ok(())
    }

    async fn get_ray_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RayCluster>, Error> {
        Ok(self.ray_clusters(namespace).get_opt(name).await?)
    }

    async fn list_ray_clusters_owned_by(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<RayCluster>, Error> {
        let selector = format!(
            "{RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY}={service_name},\
             {RAY_ORIGINATED_FROM_CRD_LABEL_KEY}={RAY_ORIGINATED_FROM_RAY_SERVICE}"
        );
        let clusters = self
            .ray_clusters(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(clusters.items)
    }

    async fn create_ray_cluster(&self, cluster: &RayCluster) -> Result<(), Error> {
        let namespace = Self::namespace_of(cluster);
        self.ray_clusters(&namespace)
            .create(&PostParams::default(), cluster)
            .await?;
        Ok(())
    }

    async fn update_ray_cluster(&self, cluster: &RayCluster) -> Result<(), Error> {
        let namespace = Self::namespace_of(cluster);
        self.ray_clusters(&namespace)
            .replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await?;
        Ok(())
    }

    async fn delete_ray_cluster(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.ray_clusters(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.services(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        let namespace = Self::namespace_of(service);
        self.services(&namespace)
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn update_service(&self, service: &Service) -> Result<(), Error> {
        let namespace = Self::namespace_of(service);
        self.services(&namespace)
            .replace(&service.name_any(), &PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_head_pod(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector =
            format!("{RAY_CLUSTER_LABEL_KEY}={cluster_name},{RAY_NODE_TYPE_LABEL_KEY}={RAY_NODE_TYPE_HEAD}");
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        if pods.items.len() > 1 {
            warn!(
                cluster = cluster_name,
                count = pods.items.len(),
                "found more than one head pod; using the first"
            );
        }
        Ok(pods.items.into_iter().next())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<(), Error> {
        let namespace = Self::namespace_of(pod);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&pod.name_any(), &PostParams::default(), pod)
            .await?;
        Ok(())
    }
}
