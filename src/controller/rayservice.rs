//! RayService reconcile driver and cluster lifecycle planner
//!
//! Each tick is edge-triggered and idempotent: fetch the declared spec and
//! observed status, plan and execute at most one cluster action, reconcile
//! the Serve applications on the upgrade candidate, swap traffic on
//! readiness, garbage-collect dangling clusters, and write status back only
//! when it meaningfully changed. The tick always requeues itself; there are
//! no long-lived tasks in the core.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{DeletionSchedule, ServeConfigCache};
use crate::clients::{
    HeadProxyClient, RestHeadProxyClient, RestServeDashboardClient, ServeDashboardClient,
};
use crate::crd::{RayCluster, RayService, RayServiceStatus, RayServiceStatuses, ServiceStatus};
use crate::error::Error;
use crate::util::{
    compare_cluster_spec_hash, generate_hash_without_replicas_and_workers_to_delete,
    generate_ray_cluster_name, is_eager_exposes_services_enabled,
    is_zero_downtime_upgrade_enabled,
};
use crate::{
    serve_service_name, DEFAULT_SERVE_CONFIG_CACHE_CAPACITY,
    HASH_WITHOUT_REPLICAS_AND_WORKERS_TO_DELETE_KEY, KUBERAY_VERSION, KUBERAY_VERSION_KEY,
    NUM_WORKER_GROUPS_KEY, RAY_CLUSTER_DELETION_DELAY, RAY_ORIGINATED_FROM_CRD_LABEL_KEY,
    RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY, RAY_ORIGINATED_FROM_RAY_SERVICE,
    SERVICE_DEFAULT_REQUEUE,
};

use super::api::{KubeRayApi, RayApi};
use super::serve::reconcile_serve;
use super::services::{label_head_pod_for_serve_status, reconcile_services, ServiceKind};
use super::status_mut;

/// Shared state and collaborators for the reconciler.
///
/// All external surfaces are trait objects so tests can substitute mocks;
/// the two process-wide maps live here so they are shared across ticks but
/// still constructible per test.
pub struct Context {
    /// Cluster API access
    pub api: Arc<dyn RayApi>,
    /// Ray dashboard REST client
    pub dashboard: Arc<dyn ServeDashboardClient>,
    /// Head-pod Serve proxy probe
    pub http_proxy: Arc<dyn HeadProxyClient>,
    /// Last applied Serve config per service and cluster
    pub serve_configs: ServeConfigCache,
    /// Deferred deletion times for dangling clusters
    pub deletion_schedule: DeletionSchedule,
    /// Gate head-pod readiness on the HeadPodReady status condition instead
    /// of probing the head pod directly
    pub status_conditions_enabled: bool,
}

impl Context {
    /// Create a production context over a Kubernetes client
    pub fn new(
        client: Client,
        serve_config_cache_capacity: usize,
        status_conditions_enabled: bool,
    ) -> Result<Self, Error> {
        Ok(Self {
            api: Arc::new(KubeRayApi::new(client)),
            dashboard: Arc::new(RestServeDashboardClient::new()?),
            http_proxy: Arc::new(RestHeadProxyClient::new()?),
            serve_configs: ServeConfigCache::new(serve_config_cache_capacity),
            deletion_schedule: DeletionSchedule::new(),
            status_conditions_enabled,
        })
    }

    /// Create a context with custom collaborators. Primarily for tests.
    pub fn with_clients(
        api: Arc<dyn RayApi>,
        dashboard: Arc<dyn ServeDashboardClient>,
        http_proxy: Arc<dyn HeadProxyClient>,
    ) -> Self {
        Self {
            api,
            dashboard,
            http_proxy,
            serve_configs: ServeConfigCache::new(DEFAULT_SERVE_CONFIG_CACHE_CAPACITY),
            deletion_schedule: DeletionSchedule::new(),
            status_conditions_enabled: true,
        }
    }
}

/// The single cluster action a tick may execute, decided by the planner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterAction {
    /// Observed state matches the goal
    DoNothing,
    /// Refresh the active cluster in place (safe mutation or metadata refresh)
    UpdateActiveCluster,
    /// Refresh the pending cluster in place (worker groups appended)
    UpdatePendingCluster,
    /// Name a fresh pending cluster and mark the service Restarting
    GeneratePendingClusterName,
    /// Create (or tear down and recreate) the pending cluster object
    CreatePendingCluster,
}

/// Which cluster slots are populated this tick.
///
/// Together with [`ServiceStatus`] these four shapes form the upgrade state
/// machine; the driver dispatches on them explicitly instead of chaining
/// nil checks.
#[derive(Clone, Copy, Debug)]
pub enum ClusterSlots<'a> {
    /// No cluster exists
    None,
    /// Steady state: one cluster serves traffic
    ActiveOnly(&'a RayCluster),
    /// Upgrade in flight: old cluster serves while the new one is validated
    Upgrading {
        /// Cluster currently receiving traffic
        active: &'a RayCluster,
        /// Upgrade candidate under validation
        pending: &'a RayCluster,
    },
    /// First rollout: a cluster is being prepared, nothing serves yet
    PendingOnly(&'a RayCluster),
}

impl<'a> ClusterSlots<'a> {
    fn observe(active: Option<&'a RayCluster>, pending: Option<&'a RayCluster>) -> Self {
        match (active, pending) {
            (None, None) => Self::None,
            (Some(active), None) => Self::ActiveOnly(active),
            (Some(active), Some(pending)) => Self::Upgrading { active, pending },
            (None, Some(pending)) => Self::PendingOnly(pending),
        }
    }
}

/// Reconcile one RayService.
///
/// The watch event only carries a possibly stale snapshot; the driver
/// re-fetches the resource, works on its own copy, and diffs the status at
/// the end to decide whether to write.
#[instrument(skip(ray_service, ctx), fields(ray_service = %ray_service.name_any()))]
pub async fn reconcile(ray_service: Arc<RayService>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = ray_service.namespace().unwrap_or_else(|| "default".to_string());
    let name = ray_service.name_any();

    let Some(mut instance) = ctx.api.get_ray_service(&namespace, &name).await? else {
        debug!("RayService no longer exists");
        return Ok(Action::await_change());
    };
    let original_status = instance.status.clone().unwrap_or_default();

    if let Err(e) = instance.spec.validate() {
        warn!(error = %e, "the RayService spec is invalid");
        if let Err(event_err) = ctx
            .api
            .publish_warning_event(&instance, "InvalidRayServiceSpec", &e.to_string())
            .await
        {
            warn!(error = %event_err, "failed to publish warning event");
        }
        return Err(e);
    }

    {
        let status = status_mut(&mut instance);
        let active = status.active_service_status.ray_cluster_name.clone();
        let pending = status.pending_service_status.ray_cluster_name.clone();
        ctx.serve_configs.cleanup(&namespace, &name, &active, &pending);
    }

    let generation = instance.metadata.generation;
    status_mut(&mut instance).observed_generation = generation;

    let (active_cluster, pending_cluster) = match reconcile_ray_cluster(&ctx, &mut instance).await {
        Ok(clusters) => clusters,
        Err(e) => {
            error!(error = %e, "failed to reconcile RayCluster instances");
            return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
        }
    };

    // A pending name without a pending object means the planner just named
    // it (or tore a stale one down). Flush the status so the Restarting
    // transition is observable, then let the next tick create the cluster.
    let pending_name = status_mut(&mut instance)
        .pending_service_status
        .ray_cluster_name
        .clone();
    if !pending_name.is_empty() && pending_cluster.is_none() {
        if let Err(e) = ctx.api.update_ray_service_status(&instance).await {
            error!(error = %e, "failed to update RayService status after cluster changes");
            return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
        }
        debug!("status flushed, next tick will create the pending RayCluster");
        return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
    }

    let mut is_ready = false;
    match ClusterSlots::observe(active_cluster.as_ref(), pending_cluster.as_ref()) {
        ClusterSlots::ActiveOnly(active) => {
            info!("reconciling Serve, only the active cluster exists");
            status_mut(&mut instance).pending_service_status = RayServiceStatus::default();
            match reconcile_serve(&ctx, &mut instance, active, true).await {
                Ok(ready) => is_ready = ready,
                Err(e) => {
                    error!(error = %e, "failed to reconcile Serve");
                    return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
                }
            }
        }
        ClusterSlots::Upgrading { active, pending } => {
            info!("reconciling Serve, active and pending clusters exist");
            // Keep the active slot's application statuses fresh for
            // observability; failures here never block the upgrade.
            if let Err(e) = reconcile_serve(&ctx, &mut instance, active, true).await {
                warn!(error = %e, "failed to refresh the active cluster's Serve status");
            }
            match reconcile_serve(&ctx, &mut instance, pending, false).await {
                Ok(ready) => is_ready = ready,
                Err(e) => {
                    error!(error = %e, "failed to reconcile Serve");
                    return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
                }
            }
        }
        ClusterSlots::PendingOnly(pending) => {
            info!("reconciling Serve, only the pending cluster exists");
            status_mut(&mut instance).active_service_status = RayServiceStatus::default();
            match reconcile_serve(&ctx, &mut instance, pending, false).await {
                Ok(ready) => is_ready = ready,
                Err(e) => {
                    error!(error = %e, "failed to reconcile Serve");
                    return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
                }
            }
        }
        ClusterSlots::None => {
            info!("no Ray cluster exists");
            let status = status_mut(&mut instance);
            status.active_service_status = RayServiceStatus::default();
            status.pending_service_status = RayServiceStatus::default();
        }
    }

    if !is_ready {
        debug!("Ray Serve applications are not ready to serve requests");
        if !is_eager_exposes_services_enabled() {
            return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
        }
    }

    // Point the front-door Services at the newest cluster: the upgrade
    // candidate when one exists, the active cluster otherwise.
    let target_cluster = pending_cluster.as_ref().or(active_cluster.as_ref());
    if let Some(cluster) = target_cluster {
        reconcile_services(&ctx, &instance, cluster, ServiceKind::Head).await?;
        label_head_pod_for_serve_status(
            &ctx,
            cluster,
            instance.spec.exclude_head_pod_from_serve_svc,
        )
        .await?;
        reconcile_services(&ctx, &instance, cluster, ServiceKind::Serve).await?;
    } else {
        debug!("no Ray cluster found, skipping service reconciliation");
    }

    if !is_ready {
        return Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE));
    }

    calculate_status(&ctx, &mut instance).await?;

    let new_status = instance.status.clone().unwrap_or_default();
    if inconsistent_ray_service_statuses(&original_status, &new_status) {
        status_mut(&mut instance).last_update_time = Some(Time(Utc::now()));
        ctx.api.update_ray_service_status(&instance).await?;
    }

    Ok(Action::requeue(SERVICE_DEFAULT_REQUEUE))
}

/// Requeue after the standard delay; the runtime adds backoff on repeats
pub fn error_policy(ray_service: Arc<RayService>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        ray_service = %ray_service.name_any(),
        "reconciliation failed"
    );
    Action::requeue(SERVICE_DEFAULT_REQUEUE)
}

/// Drive the cluster slots toward the goal spec.
///
/// Garbage-collects dangling clusters, observes the two slots, asks the
/// planner for the single action of this tick, and executes it. Returns the
/// clusters as the rest of the tick should see them.
async fn reconcile_ray_cluster(
    ctx: &Context,
    ray_service: &mut RayService,
) -> Result<(Option<RayCluster>, Option<RayCluster>), Error> {
    clean_up_dangling_clusters(ctx, ray_service).await?;

    let namespace = ray_service.namespace().unwrap_or_else(|| "default".to_string());
    let (active_name, pending_name) = {
        let status = status_mut(ray_service);
        (
            status.active_service_status.ray_cluster_name.clone(),
            status.pending_service_status.ray_cluster_name.clone(),
        )
    };

    let active_cluster = if active_name.is_empty() {
        None
    } else {
        ctx.api.get_ray_cluster(&namespace, &active_name).await?
    };
    let pending_cluster = if pending_name.is_empty() {
        None
    } else {
        ctx.api.get_ray_cluster(&namespace, &pending_name).await?
    };

    let zero_downtime_enabled = is_zero_downtime_upgrade_enabled(ray_service);
    let action = decide_cluster_action(
        ray_service,
        active_cluster.as_ref(),
        pending_cluster.as_ref(),
        zero_downtime_enabled,
    );
    match action {
        ClusterAction::GeneratePendingClusterName => {
            mark_restart_and_add_pending_cluster_name(ray_service);
            Ok((active_cluster, None))
        }
        ClusterAction::CreatePendingCluster => {
            info!("creating a new pending RayCluster instance");
            let pending_cluster = create_ray_cluster_instance(ctx, ray_service).await?;
            Ok((active_cluster, pending_cluster))
        }
        ClusterAction::UpdatePendingCluster => {
            info!("updating the pending RayCluster instance");
            let pending_name = status_mut(ray_service)
                .pending_service_status
                .ray_cluster_name
                .clone();
            let cluster = construct_ray_cluster_for_ray_service(ray_service, &pending_name)?;
            update_ray_cluster_instance(ctx, &cluster).await?;
            Ok((active_cluster, Some(cluster)))
        }
        ClusterAction::UpdateActiveCluster => {
            info!("updating the active RayCluster instance");
            let cluster = construct_ray_cluster_for_ray_service(ray_service, &active_name)?;
            update_ray_cluster_instance(ctx, &cluster).await?;
            Ok((Some(cluster), None))
        }
        ClusterAction::DoNothing => Ok((active_cluster, pending_cluster)),
    }
}

/// Schedule and eventually delete clusters that fill neither slot.
///
/// A dangling cluster is first observed, scheduled for deletion after the
/// grace period, and deleted on a later tick once its time has passed. The
/// grace window absorbs brief oscillations around a swap and lets consumers
/// drain.
async fn clean_up_dangling_clusters(ctx: &Context, ray_service: &RayService) -> Result<(), Error> {
    let namespace = ray_service.namespace().unwrap_or_else(|| "default".to_string());
    let name = ray_service.name_any();
    let status = ray_service.status.clone().unwrap_or_default();
    let active_name = &status.active_service_status.ray_cluster_name;
    let pending_name = &status.pending_service_status.ray_cluster_name;

    let clusters = ctx.api.list_ray_clusters_owned_by(&namespace, &name).await?;
    for cluster in clusters {
        let cluster_name = cluster.name_any();
        if &cluster_name == active_name || &cluster_name == pending_name {
            continue;
        }

        let now = Utc::now();
        match ctx.deletion_schedule.get(&namespace, &cluster_name) {
            None => {
                let at = now + chrono::Duration::seconds(RAY_CLUSTER_DELETION_DELAY.as_secs() as i64);
                ctx.deletion_schedule.schedule(&namespace, &cluster_name, at);
                info!(
                    cluster = %cluster_name,
                    deletion_time = %at,
                    "scheduled dangling RayCluster for deletion"
                );
            }
            Some(at) if now >= at => {
                info!(cluster = %cluster_name, scheduled_at = %at, "deleting dangling RayCluster");
                ctx.api.delete_ray_cluster(&namespace, &cluster_name).await?;
                ctx.deletion_schedule.remove(&namespace, &cluster_name);
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Decide the single cluster action for this tick.
///
/// Pure function of the declared spec, the two observed clusters, and the
/// resolved zero-downtime toggle. Hash failures never corrupt state: they
/// log and resolve to `DoNothing`.
pub fn decide_cluster_action(
    ray_service: &RayService,
    active_cluster: Option<&RayCluster>,
    pending_cluster: Option<&RayCluster>,
    zero_downtime_enabled: bool,
) -> ClusterAction {
    let goal_spec = &ray_service.spec.ray_cluster_config;
    let pending_name = ray_service
        .status
        .as_ref()
        .map(|s| s.pending_service_status.ray_cluster_name.as_str())
        .unwrap_or("");

    if !pending_name.is_empty() {
        // A named pending slot: converge the pending cluster on the goal.
        let Some(pending_cluster) = pending_cluster else {
            return ClusterAction::CreatePendingCluster;
        };
        let old_spec = &pending_cluster.spec;

        match compare_cluster_spec_hash(old_spec, goal_spec) {
            Ok(true) => return ClusterAction::DoNothing,
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "failed to hash RayCluster spec");
                return ClusterAction::DoNothing;
            }
        }

        // Appending worker groups at the tail preserves the existing groups,
        // so the pending cluster can be mutated instead of recreated.
        if goal_spec.worker_group_specs.len() > old_spec.worker_group_specs.len() {
            let mut stripped = goal_spec.clone();
            stripped
                .worker_group_specs
                .truncate(old_spec.worker_group_specs.len());
            match compare_cluster_spec_hash(old_spec, &stripped) {
                Ok(true) => return ClusterAction::UpdatePendingCluster,
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "failed to hash RayCluster spec");
                    return ClusterAction::DoNothing;
                }
            }
        }

        return ClusterAction::CreatePendingCluster;
    }

    let Some(active_cluster) = active_cluster else {
        info!("no active Ray cluster, preparing a new one");
        return ClusterAction::GeneratePendingClusterName;
    };

    // An operator version change refreshes the stored hash and version
    // annotations without touching the running cluster.
    let annotations = active_cluster.annotations();
    if annotations.get(KUBERAY_VERSION_KEY).map(String::as_str) != Some(KUBERAY_VERSION) {
        info!("active RayCluster was created by a different operator version, refreshing it");
        return ClusterAction::UpdateActiveCluster;
    }

    let goal_hash = match generate_hash_without_replicas_and_workers_to_delete(goal_spec) {
        Ok(hash) => hash,
        Err(e) => {
            error!(error = %e, "failed to serialize the goal RayCluster config");
            return ClusterAction::DoNothing;
        }
    };
    let active_hash = annotations
        .get(HASH_WITHOUT_REPLICAS_AND_WORKERS_TO_DELETE_KEY)
        .cloned()
        .unwrap_or_default();
    if active_hash == goal_hash {
        debug!("active RayCluster config matches the goal config");
        return ClusterAction::DoNothing;
    }

    let active_group_count: usize = match annotations
        .get(NUM_WORKER_GROUPS_KEY)
        .and_then(|v| v.parse().ok())
    {
        Some(count) => count,
        None => {
            error!("malformed worker-group count annotation on the active RayCluster");
            return ClusterAction::DoNothing;
        }
    };
    let goal_group_count = goal_spec.worker_group_specs.len();
    if goal_group_count > active_group_count {
        let mut stripped = goal_spec.clone();
        stripped.worker_group_specs.truncate(active_group_count);
        match generate_hash_without_replicas_and_workers_to_delete(&stripped) {
            Ok(stripped_hash) if stripped_hash == active_hash => {
                info!("worker groups appended at the tail, updating the active RayCluster in place");
                return ClusterAction::UpdateActiveCluster;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "failed to serialize the goal RayCluster config");
                return ClusterAction::DoNothing;
            }
        }
    }

    if zero_downtime_enabled {
        info!(
            active_hash = %active_hash,
            goal_hash = %goal_hash,
            "active RayCluster drifted from the goal config, preparing a new cluster"
        );
        return ClusterAction::GeneratePendingClusterName;
    }

    info!("zero-downtime upgrade is disabled, skipping new RayCluster preparation");
    ClusterAction::DoNothing
}

/// Name a fresh pending cluster and mark the service Restarting.
///
/// Name-only write: the creation is deferred to the next tick so the status
/// transition is observable first.
fn mark_restart_and_add_pending_cluster_name(ray_service: &mut RayService) {
    let name = ray_service.name_any();
    let status = status_mut(ray_service);
    info!(current = ?status.service_status, "preparing a new pending RayCluster");
    status.service_status = ServiceStatus::Restarting;
    status.pending_service_status = RayServiceStatus {
        ray_cluster_name: generate_ray_cluster_name(&name),
        ..Default::default()
    };
}

/// Create the pending cluster object.
///
/// When a stale object with the pending name still exists (the config
/// changed while it was being prepared) it is deleted and this tick returns
/// without a pending cluster; the next tick creates it fresh.
async fn create_ray_cluster_instance(
    ctx: &Context,
    ray_service: &mut RayService,
) -> Result<Option<RayCluster>, Error> {
    let namespace = ray_service.namespace().unwrap_or_else(|| "default".to_string());
    let pending_name = status_mut(ray_service)
        .pending_service_status
        .ray_cluster_name
        .clone();

    if ctx.api.get_ray_cluster(&namespace, &pending_name).await?.is_some() {
        info!(
            cluster = %pending_name,
            "pending RayCluster exists with a stale config, deleting it for recreation"
        );
        match ctx.api.delete_ray_cluster(&namespace, &pending_name).await {
            Ok(()) => return Ok(None),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    let cluster = construct_ray_cluster_for_ray_service(ray_service, &pending_name)?;
    ctx.api.create_ray_cluster(&cluster).await?;
    info!(cluster = %pending_name, "created RayCluster for RayService");
    Ok(Some(cluster))
}

/// Overwrite an existing cluster's spec, labels, and annotations.
///
/// Re-fetches the current object so the write carries the latest resource
/// version; a cluster deleted in the meantime is not an error.
async fn update_ray_cluster_instance(ctx: &Context, cluster: &RayCluster) -> Result<(), Error> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();

    let Some(mut current) = ctx.api.get_ray_cluster(&namespace, &name).await? else {
        info!(cluster = %name, "RayCluster not found, possibly deleted");
        return Ok(());
    };

    current.spec = cluster.spec.clone();
    current.metadata.labels = cluster.metadata.labels.clone();
    current.metadata.annotations = cluster.metadata.annotations.clone();

    ctx.api.update_ray_cluster(&current).await?;
    info!(cluster = %name, "updated RayCluster");
    Ok(())
}

/// Build the desired RayCluster for the service's current blueprint.
///
/// Carries the service's labels plus origin markers, the canonical hash,
/// worker-group count and operator version annotations, and an owner
/// reference for garbage collection.
fn construct_ray_cluster_for_ray_service(
    ray_service: &RayService,
    cluster_name: &str,
) -> Result<RayCluster, Error> {
    let mut labels = ray_service.labels().clone();
    labels.insert(
        RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY.to_string(),
        ray_service.name_any(),
    );
    labels.insert(
        RAY_ORIGINATED_FROM_CRD_LABEL_KEY.to_string(),
        RAY_ORIGINATED_FROM_RAY_SERVICE.to_string(),
    );

    let mut annotations = ray_service.annotations().clone();
    annotations.insert(
        HASH_WITHOUT_REPLICAS_AND_WORKERS_TO_DELETE_KEY.to_string(),
        generate_hash_without_replicas_and_workers_to_delete(&ray_service.spec.ray_cluster_config)?,
    );
    annotations.insert(
        NUM_WORKER_GROUPS_KEY.to_string(),
        ray_service
            .spec
            .ray_cluster_config
            .worker_group_specs
            .len()
            .to_string(),
    );
    annotations.insert(KUBERAY_VERSION_KEY.to_string(), KUBERAY_VERSION.to_string());

    let owner = ray_service.controller_owner_ref(&()).ok_or_else(|| {
        Error::cluster_state("RayService has no metadata for an owner reference")
    })?;

    Ok(RayCluster {
        metadata: ObjectMeta {
            name: Some(cluster_name.to_string()),
            namespace: ray_service.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: ray_service.spec.ray_cluster_config.clone(),
        status: None,
    })
}

/// Promote the pending cluster once it is the ready one.
///
/// Active-role transitions happen only here, at the moment the Serve
/// reconciler reports readiness against the pending cluster.
pub(crate) fn update_ray_cluster_info(ray_service: &mut RayService, healthy_cluster_name: &str) {
    let status = status_mut(ray_service);
    if status.active_service_status.ray_cluster_name != healthy_cluster_name {
        info!(
            old = %status.active_service_status.ray_cluster_name,
            new = %healthy_cluster_name,
            "promoting pending RayCluster to active"
        );
        status.active_service_status = std::mem::take(&mut status.pending_service_status);
    }
}

/// Count serve endpoints from the serve service's Endpoints object
async fn calculate_status(ctx: &Context, ray_service: &mut RayService) -> Result<(), Error> {
    let namespace = ray_service.namespace().unwrap_or_else(|| "default".to_string());
    let name = ray_service.name_any();

    let endpoints = ctx
        .api
        .get_endpoints(&namespace, &serve_service_name(&name))
        .await?;

    // Addresses are grouped into subsets by shared port sets; every ready
    // address counts as one serve endpoint.
    let mut count: usize = 0;
    if let Some(endpoints) = endpoints {
        for subset in endpoints.subsets.unwrap_or_default() {
            count += subset.addresses.map(|a| a.len()).unwrap_or(0);
        }
    }
    status_mut(ray_service).num_serve_endpoints = i32::try_from(count)
        .map_err(|_| Error::status("numServeEndpoints exceeds i32::MAX"))?;
    Ok(())
}

/// Per-slot status comparison.
///
/// `healthLastUpdateTime` and the `rayClusterStatus` snapshot are excluded
/// so pure timestamp churn never triggers a status write.
fn inconsistent_ray_service_status(old: &RayServiceStatus, new: &RayServiceStatus) -> bool {
    if old.ray_cluster_name != new.ray_cluster_name {
        return true;
    }
    if old.applications.len() != new.applications.len() {
        return true;
    }
    for (app_name, new_app) in &new.applications {
        let Some(old_app) = old.applications.get(app_name) else {
            return true;
        };
        if old_app.status != new_app.status || old_app.message != new_app.message {
            return true;
        }
        if old_app.deployments.len() != new_app.deployments.len() {
            return true;
        }
        for (deployment_name, new_deployment) in &new_app.deployments {
            let Some(old_deployment) = old_app.deployments.get(deployment_name) else {
                return true;
            };
            if old_deployment.status != new_deployment.status
                || old_deployment.message != new_deployment.message
            {
                return true;
            }
        }
    }
    false
}

/// Whether the computed status differs from the observed one on any
/// non-timestamp field
fn inconsistent_ray_service_statuses(old: &RayServiceStatuses, new: &RayServiceStatuses) -> bool {
    if old.service_status != new.service_status {
        debug!(
            old = ?old.service_status,
            new = ?new.service_status,
            "ServiceStatus changed"
        );
        return true;
    }
    if old.num_serve_endpoints != new.num_serve_endpoints {
        debug!(
            old = old.num_serve_endpoints,
            new = new.num_serve_endpoints,
            "NumServeEndpoints changed"
        );
        return true;
    }
    if inconsistent_ray_service_status(&old.active_service_status, &new.active_service_status) {
        debug!("active service status changed");
        return true;
    }
    if inconsistent_ray_service_status(&old.pending_service_status, &new.pending_service_status) {
        debug!("pending service status changed");
        return true;
    }
    false
}
