//! Serve application reconciliation
//!
//! Targets whichever cluster is the current upgrade candidate: gates on the
//! head pod being ready, pushes the Serve config to the cluster dashboard
//! when it drifted from the per-cluster cache, polls application statuses,
//! and reports readiness back to the driver. Readiness against the pending
//! cluster is what triggers the traffic swap.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cache::ServeConfigCache;
use crate::clients::ServeDashboardClient;
use crate::crd::{
    app_status, deployment_status, AppStatus, RayCluster, RayService, RayServiceStatus,
    ServeDeploymentStatus, ServiceStatus,
};
use crate::error::Error;
use crate::util::is_pod_running_and_ready;
use crate::{head_service_name, DASHBOARD_PORT_NAME, DEFAULT_DASHBOARD_PORT, DEFAULT_SERVE_APP_NAME};

use super::rayservice::update_ray_cluster_info;
use super::{status_mut, Context};

/// Reconcile the Serve applications on the given cluster.
///
/// Returns whether the cluster is ready to handle incoming traffic. During
/// an upgrade the active cluster also passes through here (`is_active` with
/// a pending slot populated) purely to refresh its observed application
/// statuses; config pushes and `ServiceStatus` transitions are suppressed
/// for that pass because they belong to the upgrade candidate.
pub(crate) async fn reconcile_serve(
    ctx: &Context,
    ray_service: &mut RayService,
    cluster: &RayCluster,
    is_active: bool,
) -> Result<bool, Error> {
    let namespace = ray_service.namespace().unwrap_or_else(|| "default".to_string());
    let service_name = ray_service.name_any();
    let cluster_name = cluster.name_any();
    let serve_config = ray_service.spec.serve_config_v2.clone();

    let upgrade_target = {
        let status = status_mut(ray_service);
        !is_active || status.pending_service_status.ray_cluster_name.is_empty()
    };

    // Snapshot the cluster status into the slot under reconciliation.
    {
        let status = status_mut(ray_service);
        let slot = if is_active {
            &mut status.active_service_status
        } else {
            &mut status.pending_service_status
        };
        slot.ray_cluster_status = cluster.status.clone().unwrap_or_default();
    }

    // The dashboard and GCS take a few seconds to come up after the head pod
    // is ready, so early dashboard calls may still fail; that is tolerable
    // because the push is idempotent and the tick requeues.
    if !is_head_pod_running_and_ready(ctx, &namespace, cluster).await? {
        debug!(cluster = %cluster_name, "head pod is not ready, deferring Serve reconciliation");
        return Ok(false);
    }

    let Some(dashboard_url) = fetch_dashboard_url(ctx, &namespace, &cluster_name).await? else {
        warn!(cluster = %cluster_name, "head service not found, deferring Serve reconciliation");
        return Ok(false);
    };

    let should_update = upgrade_target && {
        let status = status_mut(ray_service);
        let slot = if is_active {
            &status.active_service_status
        } else {
            &status.pending_service_status
        };
        check_if_need_submit_serve_deployment(
            &ctx.serve_configs,
            &namespace,
            &service_name,
            &serve_config,
            &cluster_name,
            slot,
        )
    };

    if should_update {
        update_serve_deployment(
            ctx,
            &namespace,
            &service_name,
            &serve_config,
            &dashboard_url,
            &cluster_name,
        )
        .await?;
    }

    let is_ready = {
        let status = status_mut(ray_service);
        let slot = if is_active {
            &mut status.active_service_status
        } else {
            &mut status.pending_service_status
        };
        get_and_check_serve_status(ctx.dashboard.as_ref(), &dashboard_url, slot).await?
    };

    debug!(is_ready, is_active, cluster = %cluster_name, "checked Serve health");

    if upgrade_target {
        if is_ready {
            status_mut(ray_service).service_status = ServiceStatus::Running;
            update_ray_cluster_info(ray_service, &cluster_name);
        } else {
            // Flush immediately so operators see the wait state without
            // waiting for the tick to finish.
            status_mut(ray_service).service_status = ServiceStatus::WaitForServeDeploymentReady;
            ctx.api.update_ray_service_status(ray_service).await?;
            debug!(cluster = %cluster_name, "marked service as waiting for Serve applications");
        }
    }

    Ok(is_ready)
}

/// Head-pod gate: status condition when enabled, direct pod probe otherwise.
///
/// A missing or unready head pod is a soft failure; the tick completes and
/// requeues rather than erroring.
async fn is_head_pod_running_and_ready(
    ctx: &Context,
    namespace: &str,
    cluster: &RayCluster,
) -> Result<bool, Error> {
    if ctx.status_conditions_enabled {
        return Ok(cluster
            .status
            .as_ref()
            .map(|s| s.head_pod_ready())
            .unwrap_or(false));
    }

    match ctx.api.get_head_pod(namespace, &cluster.name_any()).await? {
        Some(pod) => Ok(is_pod_running_and_ready(&pod)),
        None => {
            warn!(cluster = %cluster.name_any(), "found 0 head pods");
            Ok(false)
        }
    }
}

/// Dashboard base URL for a cluster, via its head service's dashboard port
async fn fetch_dashboard_url(
    ctx: &Context,
    namespace: &str,
    cluster_name: &str,
) -> Result<Option<String>, Error> {
    let svc_name = head_service_name(cluster_name);
    let Some(service) = ctx.api.get_service(namespace, &svc_name).await? else {
        return Ok(None);
    };
    let port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(DASHBOARD_PORT_NAME))
        })
        .map(|p| p.port)
        .unwrap_or(DEFAULT_DASHBOARD_PORT);
    Ok(Some(format!(
        "http://{svc_name}.{namespace}.svc.cluster.local:{port}"
    )))
}

/// Whether the Serve config must be (re)pushed to the cluster this tick
pub(crate) fn check_if_need_submit_serve_deployment(
    cache: &ServeConfigCache,
    namespace: &str,
    service_name: &str,
    goal_serve_config: &str,
    cluster_name: &str,
    slot: &RayServiceStatus,
) -> bool {
    let Some(cached) = cache.get(namespace, service_name, cluster_name) else {
        info!(
            cluster = cluster_name,
            reason = "nothing cached for this cluster",
            "Serve config push needed"
        );
        return true;
    };

    // The head pod may have restarted without GCS fault tolerance, wiping
    // the applications while the cache still claims they were applied.
    if slot.applications.is_empty() {
        info!(
            cluster = cluster_name,
            reason = "no Serve applications reported on the cluster",
            "Serve config push needed"
        );
        return true;
    }

    if cached != goal_serve_config {
        info!(
            cluster = cluster_name,
            reason = "Serve config changed since the last push",
            "Serve config push needed"
        );
        return true;
    }

    debug!(cluster = cluster_name, "Serve config matches cache, skipping push");
    false
}

/// Transcode the Serve config YAML to JSON, push it, and cache it on success
async fn update_serve_deployment(
    ctx: &Context,
    namespace: &str,
    service_name: &str,
    serve_config_yaml: &str,
    dashboard_url: &str,
    cluster_name: &str,
) -> Result<(), Error> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(serve_config_yaml)
        .map_err(|e| Error::serialization(format!("failed to parse serveConfigV2 as YAML: {e}")))?;
    let config_json = serde_json::to_vec(&parsed)
        .map_err(|e| Error::serialization(format!("failed to encode serve config as JSON: {e}")))?;

    ctx.dashboard
        .update_deployments(dashboard_url, &config_json)
        .await
        .map_err(|e| {
            Error::dashboard(format!(
                "failed to create / update Serve applications on cluster {cluster_name}: {e}"
            ))
        })?;

    ctx.serve_configs
        .put(namespace, service_name, cluster_name, serve_config_yaml);
    info!(cluster = cluster_name, "pushed Serve config and cached it");
    Ok(())
}

fn is_serve_app_unhealthy_or_deploy_failed(status: &str) -> bool {
    status == app_status::UNHEALTHY || status == app_status::DEPLOY_FAILED
}

/// Poll the dashboard and merge application statuses into the slot.
///
/// Readiness is the conjunction over all applications of `status == RUNNING`;
/// zero applications means not ready. `healthLastUpdateTime` is preserved
/// from the previous snapshot only while both the old and new statuses sit in
/// the unhealthy set (UNHEALTHY / DEPLOY_FAILED for applications, UNHEALTHY
/// for deployments); any other transition restamps it with now. External
/// alerting measures outage length from this field, so the rule is exact.
pub(crate) async fn get_and_check_serve_status(
    dashboard: &dyn ServeDashboardClient,
    dashboard_url: &str,
    slot: &mut RayServiceStatus,
) -> Result<bool, Error> {
    let serve_statuses = dashboard
        .get_multi_application_status(dashboard_url)
        .await
        .map_err(|e| {
            Error::dashboard(format!(
                "failed to get Serve application statuses from the dashboard: {e}"
            ))
        })?;

    let now = Time(Utc::now());
    let mut is_ready = true;
    let mut new_applications = BTreeMap::new();

    for (app_name, app) in serve_statuses {
        let app_name = if app_name.is_empty() {
            DEFAULT_SERVE_APP_NAME.to_string()
        } else {
            app_name
        };
        let prev = slot.applications.get(&app_name).cloned().unwrap_or_default();

        let mut application = AppStatus {
            status: app.status.clone(),
            message: app.message.clone(),
            health_last_update_time: Some(now.clone()),
            deployments: BTreeMap::new(),
        };

        if is_serve_app_unhealthy_or_deploy_failed(&app.status)
            && is_serve_app_unhealthy_or_deploy_failed(&prev.status)
        {
            if let Some(last) = &prev.health_last_update_time {
                application.health_last_update_time = Some(last.clone());
                info!(
                    app = %app_name,
                    health_last_update_time = ?last,
                    "Serve application has been unhealthy or deploy-failed since the last update"
                );
            }
        }

        if app.status != app_status::RUNNING {
            is_ready = false;
        }

        for (deployment_name, deployment) in app.deployments {
            let mut status = ServeDeploymentStatus {
                status: deployment.status.clone(),
                message: deployment.message,
                health_last_update_time: Some(now.clone()),
            };
            if deployment.status == deployment_status::UNHEALTHY {
                if let Some(prev_deployment) = prev.deployments.get(&deployment_name) {
                    if prev_deployment.status == deployment_status::UNHEALTHY {
                        status.health_last_update_time =
                            prev_deployment.health_last_update_time.clone();
                    }
                }
            }
            application.deployments.insert(deployment_name, status);
        }

        new_applications.insert(app_name, application);
    }

    if new_applications.is_empty() {
        debug!("no Serve applications found, the cluster is not ready to serve requests");
        is_ready = false;
    }
    slot.applications = new_applications;
    Ok(is_ready)
}
