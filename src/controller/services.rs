//! Front-door Service reconciliation
//!
//! Two Services route external traffic into the current cluster: the head
//! service (dashboard, GCS, client) and the serve service (Serve proxy
//! traffic). Both select pods by the `ray.io/cluster` label, so a traffic
//! swap during upgrade is a selector rewrite on the existing object rather
//! than a recreate; the ClusterIP is preserved because it is immutable.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::{RayCluster, RayService};
use crate::error::Error;
use crate::util::find_container_port;
use crate::{
    head_service_name, serve_service_name, DASHBOARD_PORT_NAME, DEFAULT_DASHBOARD_PORT,
    DEFAULT_SERVING_PORT, RAY_CLUSTER_LABEL_KEY, RAY_NODE_TYPE_HEAD, RAY_NODE_TYPE_LABEL_KEY,
    RAY_ORIGINATED_FROM_CRD_LABEL_KEY, RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY,
    RAY_ORIGINATED_FROM_RAY_SERVICE, RAY_SERVING_SERVICE_LABEL_KEY, SERVING_PORT_NAME,
};

use super::Context;

/// The two front-door Service kinds owned by a RayService
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    /// Routes to the head pod: dashboard, GCS, Ray client
    Head,
    /// Routes Serve traffic to every pod with a healthy proxy
    Serve,
}

/// Build the desired Service object for the given kind, pointing at the
/// given cluster.
pub(crate) fn build_service(
    ray_service: &RayService,
    cluster: &RayCluster,
    kind: ServiceKind,
) -> Service {
    let service_name = ray_service.name_any();
    let cluster_name = cluster.name_any();

    let mut labels = ray_service.labels().clone();
    labels.insert(
        RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY.to_string(),
        service_name.clone(),
    );
    labels.insert(
        RAY_ORIGINATED_FROM_CRD_LABEL_KEY.to_string(),
        RAY_ORIGINATED_FROM_RAY_SERVICE.to_string(),
    );

    let mut selector = BTreeMap::new();
    selector.insert(RAY_CLUSTER_LABEL_KEY.to_string(), cluster_name);

    let (name, ports) = match kind {
        ServiceKind::Head => {
            selector.insert(
                RAY_NODE_TYPE_LABEL_KEY.to_string(),
                RAY_NODE_TYPE_HEAD.to_string(),
            );
            (head_service_name(&service_name), head_service_ports(cluster))
        }
        ServiceKind::Serve => {
            selector.insert(
                RAY_SERVING_SERVICE_LABEL_KEY.to_string(),
                "true".to_string(),
            );
            (serve_service_name(&service_name), serve_service_ports(cluster))
        }
    };

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: ray_service.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(ports),
            type_: cluster.spec.head_group_spec.service_type.clone(),
            ..Default::default()
        }),
        status: None,
    }
}

/// Ports for the head service: every named port on the head container, or
/// the conventional defaults when the template names none.
fn head_service_ports(cluster: &RayCluster) -> Vec<ServicePort> {
    let named: Vec<ServicePort> = cluster
        .spec
        .head_group_spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter(|p| p.name.is_some())
                .map(|p| ServicePort {
                    name: p.name.clone(),
                    port: p.container_port,
                    ..Default::default()
                })
                .collect()
        })
        .unwrap_or_default();

    if !named.is_empty() {
        return named;
    }

    [
        ("gcs", 6379),
        (DASHBOARD_PORT_NAME, DEFAULT_DASHBOARD_PORT),
        ("client", 10001),
        (SERVING_PORT_NAME, DEFAULT_SERVING_PORT),
    ]
    .iter()
    .map(|(name, port)| ServicePort {
        name: Some(name.to_string()),
        port: *port,
        ..Default::default()
    })
    .collect()
}

fn serve_service_ports(cluster: &RayCluster) -> Vec<ServicePort> {
    let port = cluster
        .spec
        .head_group_spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| find_container_port(c, SERVING_PORT_NAME, DEFAULT_SERVING_PORT))
        .unwrap_or(DEFAULT_SERVING_PORT);
    vec![ServicePort {
        name: Some(SERVING_PORT_NAME.to_string()),
        port,
        ..Default::default()
    }]
}

fn selected_cluster(service: &Service) -> Option<&String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|sel| sel.get(RAY_CLUSTER_LABEL_KEY))
}

/// Drive one front-door Service toward the desired cluster.
///
/// Existing object pointing at the right cluster: no-op. Existing object
/// pointing elsewhere: selector swap preserving the ClusterIP. Missing
/// object: create with an owner reference, tolerating a concurrent create.
pub(crate) async fn reconcile_services(
    ctx: &Context,
    ray_service: &RayService,
    cluster: &RayCluster,
    kind: ServiceKind,
) -> Result<(), Error> {
    let namespace = ray_service.namespace().unwrap_or_else(|| "default".to_string());
    let mut desired = build_service(ray_service, cluster, kind);
    let name = desired.metadata.name.clone().unwrap_or_default();

    match ctx.api.get_service(&namespace, &name).await? {
        Some(mut existing) => {
            if selected_cluster(&existing) == selected_cluster(&desired) {
                debug!(service = %name, ?kind, "service already selects the target cluster");
                return Ok(());
            }

            // ClusterIP is immutable; carry it over before replacing the spec.
            let cluster_ip = existing.spec.as_ref().and_then(|s| s.cluster_ip.clone());
            let mut new_spec = desired.spec.take().unwrap_or_default();
            new_spec.cluster_ip = cluster_ip;
            existing.spec = Some(new_spec);

            info!(service = %name, ?kind, cluster = %cluster.name_any(), "switching service to new cluster");
            ctx.api.update_service(&existing).await
        }
        None => {
            let owner = ray_service.controller_owner_ref(&()).ok_or_else(|| {
                Error::cluster_state("RayService has no metadata for an owner reference")
            })?;
            desired.metadata.owner_references = Some(vec![owner]);

            info!(service = %name, ?kind, "creating service");
            match ctx.api.create_service(&desired).await {
                Err(e) if e.is_already_exists() => {
                    debug!(service = %name, "service already exists, benign create race");
                    Ok(())
                }
                other => other,
            }
        }
    }
}

/// Label the head pod in or out of the serve service.
///
/// The head pod joins the serve service only while its proxy actor answers
/// health probes and the spec does not exclude it. The pod is rewritten only
/// when the label value actually changes.
pub(crate) async fn label_head_pod_for_serve_status(
    ctx: &Context,
    cluster: &RayCluster,
    exclude_head_pod: bool,
) -> Result<(), Error> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let cluster_name = cluster.name_any();

    let Some(mut head_pod) = ctx.api.get_head_pod(&namespace, &cluster_name).await? else {
        return Err(Error::cluster_state(format!(
            "found 0 head pods for RayCluster {namespace}/{cluster_name}"
        )));
    };

    let pod_ip = head_pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_default();
    let serving_port = head_pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| find_container_port(c, SERVING_PORT_NAME, DEFAULT_SERVING_PORT))
        .unwrap_or(DEFAULT_SERVING_PORT);

    let healthy = !pod_ip.is_empty()
        && ctx
            .http_proxy
            .check_proxy_actor_health(&pod_ip, serving_port)
            .await
            .is_ok();
    let desired_value = if healthy && !exclude_head_pod {
        "true"
    } else {
        "false"
    };

    let labels = head_pod.metadata.labels.get_or_insert_with(Default::default);
    if labels.get(RAY_SERVING_SERVICE_LABEL_KEY).map(String::as_str) == Some(desired_value) {
        return Ok(());
    }
    labels.insert(
        RAY_SERVING_SERVICE_LABEL_KEY.to_string(),
        desired_value.to_string(),
    );

    info!(pod = %head_pod.name_any(), value = desired_value, "updating head pod serve label");
    ctx.api.update_pod(&head_pod).await
}

#[cfg(test)]
mod tests {
    use super::super::api::MockRayApi;
    use super::*;
    use crate::clients::{MockHeadProxyClient, MockServeDashboardClient};
    use crate::crd::{RayClusterSpec, RayServiceSpec};
    use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodSpec, PodStatus};
    use std::sync::{Arc, Mutex};

    fn sample_ray_service(name: &str) -> RayService {
        let mut ray_service = RayService::new(name, RayServiceSpec::default());
        ray_service.metadata.namespace = Some("default".to_string());
        ray_service.metadata.uid = Some("uid-1234".to_string());
        ray_service
    }

    fn sample_cluster(name: &str) -> RayCluster {
        let mut cluster = RayCluster::new(name, RayClusterSpec::default());
        cluster.metadata.namespace = Some("default".to_string());
        cluster
    }

    fn context_with(api: MockRayApi, proxy: MockHeadProxyClient) -> Context {
        Context::with_clients(
            Arc::new(api),
            Arc::new(MockServeDashboardClient::new()),
            Arc::new(proxy),
        )
    }

    fn head_pod(labels: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("cluster-head".to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "ray-head".to_string(),
                ports: Some(vec![ContainerPort {
                    name: Some("serve".to_string()),
                    container_port: 8000,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            pod_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        });
        pod
    }

    // =========================================================================
    // Builder stories
    // =========================================================================

    /// Story: the head service selects head pods of the target cluster
    #[test]
    fn story_head_service_selects_head_pods() {
        let ray_service = sample_ray_service("a");
        let cluster = sample_cluster("a-raycluster-abcde");

        let svc = build_service(&ray_service, &cluster, ServiceKind::Head);
        assert_eq!(svc.metadata.name.as_deref(), Some("a-head-svc"));

        let selector = svc.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(
            selector.get(RAY_CLUSTER_LABEL_KEY).map(String::as_str),
            Some("a-raycluster-abcde")
        );
        assert_eq!(
            selector.get(RAY_NODE_TYPE_LABEL_KEY).map(String::as_str),
            Some("head")
        );

        let ports = svc.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert!(ports.iter().any(|p| p.name.as_deref() == Some("dashboard")));
    }

    /// Story: the serve service selects only pods labeled into serving
    #[test]
    fn story_serve_service_selects_serving_pods() {
        let ray_service = sample_ray_service("a");
        let cluster = sample_cluster("a-raycluster-abcde");

        let svc = build_service(&ray_service, &cluster, ServiceKind::Serve);
        assert_eq!(svc.metadata.name.as_deref(), Some("a-serve-svc"));

        let selector = svc.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(
            selector.get(RAY_SERVING_SERVICE_LABEL_KEY).map(String::as_str),
            Some("true")
        );

        let ports = svc.spec.as_ref().unwrap().ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, DEFAULT_SERVING_PORT);
    }

    // =========================================================================
    // Reconcile stories
    // =========================================================================

    /// Story: a service already selecting the target cluster is left alone
    #[tokio::test]
    async fn story_matching_selector_is_a_noop() {
        let ray_service = sample_ray_service("a");
        let cluster = sample_cluster("a-raycluster-abcde");
        let existing = build_service(&ray_service, &cluster, ServiceKind::Serve);

        let mut api = MockRayApi::new();
        api.expect_get_service()
            .returning(move |_, _| Ok(Some(existing.clone())));
        // No update_service or create_service expectation: calling either
        // would panic the mock and fail the story.

        let ctx = context_with(api, MockHeadProxyClient::new());
        reconcile_services(&ctx, &ray_service, &cluster, ServiceKind::Serve)
            .await
            .unwrap();
    }

    /// Story: on cluster switch the selector is rewritten and the ClusterIP
    /// survives
    ///
    /// ClusterIP is immutable; dropping it on the update would be rejected by
    /// the API server and, worse, changing it would break in-flight clients.
    #[tokio::test]
    async fn story_cluster_switch_preserves_cluster_ip() {
        let ray_service = sample_ray_service("a");
        let old_cluster = sample_cluster("a-raycluster-old11");
        let new_cluster = sample_cluster("a-raycluster-new22");

        let mut existing = build_service(&ray_service, &old_cluster, ServiceKind::Serve);
        existing.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.42".to_string());

        let updated: Arc<Mutex<Option<Service>>> = Arc::new(Mutex::new(None));
        let updated_clone = updated.clone();

        let mut api = MockRayApi::new();
        api.expect_get_service()
            .returning(move |_, _| Ok(Some(existing.clone())));
        api.expect_update_service().returning(move |svc| {
            *updated_clone.lock().unwrap() = Some(svc.clone());
            Ok(())
        });

        let ctx = context_with(api, MockHeadProxyClient::new());
        reconcile_services(&ctx, &ray_service, &new_cluster, ServiceKind::Serve)
            .await
            .unwrap();

        let written = updated.lock().unwrap().clone().expect("service updated");
        let spec = written.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.42"));
        assert_eq!(
            spec.selector.unwrap().get(RAY_CLUSTER_LABEL_KEY).map(String::as_str),
            Some("a-raycluster-new22")
        );
    }

    /// Story: a missing service is created with an owner reference
    #[tokio::test]
    async fn story_missing_service_is_created_with_owner_ref() {
        let ray_service = sample_ray_service("a");
        let cluster = sample_cluster("a-raycluster-abcde");

        let created: Arc<Mutex<Option<Service>>> = Arc::new(Mutex::new(None));
        let created_clone = created.clone();

        let mut api = MockRayApi::new();
        api.expect_get_service().returning(|_, _| Ok(None));
        api.expect_create_service().returning(move |svc| {
            *created_clone.lock().unwrap() = Some(svc.clone());
            Ok(())
        });

        let ctx = context_with(api, MockHeadProxyClient::new());
        reconcile_services(&ctx, &ray_service, &cluster, ServiceKind::Head)
            .await
            .unwrap();

        let written = created.lock().unwrap().clone().expect("service created");
        let owners = written.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "RayService");
        assert_eq!(owners[0].name, "a");
    }

    /// Story: a create race with another reconcile is benign
    #[tokio::test]
    async fn story_create_race_is_tolerated() {
        let ray_service = sample_ray_service("a");
        let cluster = sample_cluster("a-raycluster-abcde");

        let mut api = MockRayApi::new();
        api.expect_get_service().returning(|_, _| Ok(None));
        api.expect_create_service().returning(|_| {
            Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "already exists".to_string(),
                reason: "AlreadyExists".to_string(),
                code: 409,
            })))
        });

        let ctx = context_with(api, MockHeadProxyClient::new());
        assert!(reconcile_services(&ctx, &ray_service, &cluster, ServiceKind::Head)
            .await
            .is_ok());
    }

    // =========================================================================
    // Head pod labeling stories
    // =========================================================================

    /// Story: a healthy proxy pulls the head pod into the serve service
    #[tokio::test]
    async fn story_healthy_proxy_labels_head_pod_true() {
        let cluster = sample_cluster("a-raycluster-abcde");
        let pod = head_pod(&[(RAY_SERVING_SERVICE_LABEL_KEY, "false")]);

        let updated: Arc<Mutex<Option<Pod>>> = Arc::new(Mutex::new(None));
        let updated_clone = updated.clone();

        let mut api = MockRayApi::new();
        api.expect_get_head_pod()
            .returning(move |_, _| Ok(Some(pod.clone())));
        api.expect_update_pod().returning(move |p| {
            *updated_clone.lock().unwrap() = Some(p.clone());
            Ok(())
        });

        let mut proxy = MockHeadProxyClient::new();
        proxy
            .expect_check_proxy_actor_health()
            .returning(|_, _| Ok(()));

        let ctx = context_with(api, proxy);
        label_head_pod_for_serve_status(&ctx, &cluster, false)
            .await
            .unwrap();

        let written = updated.lock().unwrap().clone().expect("pod updated");
        assert_eq!(
            written.metadata.labels.unwrap().get(RAY_SERVING_SERVICE_LABEL_KEY).map(String::as_str),
            Some("true")
        );
    }

    /// Story: excluding the head pod wins over a healthy proxy
    #[tokio::test]
    async fn story_excluded_head_pod_is_labeled_false() {
        let cluster = sample_cluster("a-raycluster-abcde");
        let pod = head_pod(&[(RAY_SERVING_SERVICE_LABEL_KEY, "true")]);

        let updated: Arc<Mutex<Option<Pod>>> = Arc::new(Mutex::new(None));
        let updated_clone = updated.clone();

        let mut api = MockRayApi::new();
        api.expect_get_head_pod()
            .returning(move |_, _| Ok(Some(pod.clone())));
        api.expect_update_pod().returning(move |p| {
            *updated_clone.lock().unwrap() = Some(p.clone());
            Ok(())
        });

        let mut proxy = MockHeadProxyClient::new();
        proxy
            .expect_check_proxy_actor_health()
            .returning(|_, _| Ok(()));

        let ctx = context_with(api, proxy);
        label_head_pod_for_serve_status(&ctx, &cluster, true)
            .await
            .unwrap();

        let written = updated.lock().unwrap().clone().expect("pod updated");
        assert_eq!(
            written.metadata.labels.unwrap().get(RAY_SERVING_SERVICE_LABEL_KEY).map(String::as_str),
            Some("false")
        );
    }

    /// Story: an unchanged label writes nothing
    ///
    /// Pod updates bump the resource version and wake every watcher; the
    /// label is rewritten only on transitions.
    #[tokio::test]
    async fn story_unchanged_label_writes_nothing() {
        let cluster = sample_cluster("a-raycluster-abcde");
        let pod = head_pod(&[(RAY_SERVING_SERVICE_LABEL_KEY, "true")]);

        let mut api = MockRayApi::new();
        api.expect_get_head_pod()
            .returning(move |_, _| Ok(Some(pod.clone())));
        // No update_pod expectation: an update would panic the mock.

        let mut proxy = MockHeadProxyClient::new();
        proxy
            .expect_check_proxy_actor_health()
            .returning(|_, _| Ok(()));

        let ctx = context_with(api, proxy);
        label_head_pod_for_serve_status(&ctx, &cluster, false)
            .await
            .unwrap();
    }

    /// Story: a failed probe drops the head pod out of the serve service
    #[tokio::test]
    async fn story_failed_probe_labels_head_pod_false() {
        let cluster = sample_cluster("a-raycluster-abcde");
        let pod = head_pod(&[(RAY_SERVING_SERVICE_LABEL_KEY, "true")]);

        let updated: Arc<Mutex<Option<Pod>>> = Arc::new(Mutex::new(None));
        let updated_clone = updated.clone();

        let mut api = MockRayApi::new();
        api.expect_get_head_pod()
            .returning(move |_, _| Ok(Some(pod.clone())));
        api.expect_update_pod().returning(move |p| {
            *updated_clone.lock().unwrap() = Some(p.clone());
            Ok(())
        });

        let mut proxy = MockHeadProxyClient::new();
        proxy
            .expect_check_proxy_actor_health()
            .returning(|_, _| Err(Error::dashboard("proxy actor health probe returned 503")));

        let ctx = context_with(api, proxy);
        label_head_pod_for_serve_status(&ctx, &cluster, false)
            .await
            .unwrap();

        let written = updated.lock().unwrap().clone().expect("pod updated");
        assert_eq!(
            written.metadata.labels.unwrap().get(RAY_SERVING_SERVICE_LABEL_KEY).map(String::as_str),
            Some("false")
        );
    }

    /// Story: a missing head pod is an error the driver turns into a requeue
    #[tokio::test]
    async fn story_missing_head_pod_is_an_error() {
        let cluster = sample_cluster("a-raycluster-abcde");

        let mut api = MockRayApi::new();
        api.expect_get_head_pod().returning(|_, _| Ok(None));

        let ctx = context_with(api, MockHeadProxyClient::new());
        let err = label_head_pod_for_serve_status(&ctx, &cluster, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("0 head pods"));
    }
}
