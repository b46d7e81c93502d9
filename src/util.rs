//! Spec hashing, name generation, and environment toggles

use k8s_openapi::api::core::v1::{Container, Pod};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::crd::{upgrade_type, RayClusterSpec, RayService};
use crate::error::Error;
use crate::{EAGER_EXPOSES_SERVICES_ENV, ENABLE_ZERO_DOWNTIME_ENV};

/// Canonical hash of a RayCluster spec with autoscaler-mutable fields elided.
///
/// The autoscaler continuously rewrites `replicas`, `minReplicas`,
/// `maxReplicas` and `scaleStrategy.workersToDelete`; those fields must never
/// make a cluster look drifted from its goal config. Everything else feeds a
/// SHA-256 over the canonical JSON encoding. This hash is the only authority
/// for "has the spec meaningfully changed", so the elision set and the
/// encoding must stay stable across operator versions.
pub fn generate_hash_without_replicas_and_workers_to_delete(
    spec: &RayClusterSpec,
) -> Result<String, Error> {
    let mut canonical = spec.clone();
    for group in &mut canonical.worker_group_specs {
        group.replicas = None;
        group.min_replicas = None;
        group.max_replicas = None;
        group.scale_strategy.workers_to_delete = None;
    }

    let encoded = serde_json::to_vec(&canonical)
        .map_err(|e| Error::serialization(format!("failed to serialize RayCluster spec: {e}")))?;
    let digest = Sha256::digest(&encoded);
    Ok(base16ct::lower::encode_string(&digest))
}

/// Compare two cluster specs by canonical hash
pub fn compare_cluster_spec_hash(a: &RayClusterSpec, b: &RayClusterSpec) -> Result<bool, Error> {
    Ok(generate_hash_without_replicas_and_workers_to_delete(a)?
        == generate_hash_without_replicas_and_workers_to_delete(b)?)
}

/// Generate a fresh cluster name for a RayService: `{service}-raycluster-{suffix}`
pub fn generate_ray_cluster_name(service_name: &str) -> String {
    format!("{service_name}-raycluster-{}", random_suffix(5))
}

fn random_suffix(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Whether cluster rollout (new cluster then switch) is enabled for this
/// service.
///
/// `spec.upgradeStrategy.type` takes precedence; otherwise the
/// `ENABLE_ZERO_DOWNTIME` environment variable disables rollout when set to
/// "false" (case-insensitive). Unset means enabled.
pub fn is_zero_downtime_upgrade_enabled(ray_service: &RayService) -> bool {
    if let Some(type_) = ray_service
        .spec
        .upgrade_strategy
        .as_ref()
        .and_then(|s| s.type_.as_deref())
    {
        return type_ == upgrade_type::NEW_CLUSTER;
    }
    !std::env::var(ENABLE_ZERO_DOWNTIME_ENV)
        .map(|v| v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

/// Whether the front-door Services are reconciled before Serve is ready
pub fn is_eager_exposes_services_enabled() -> bool {
    std::env::var(EAGER_EXPOSES_SERVICES_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Find a named container port, falling back to a default
pub fn find_container_port(container: &Container, name: &str, default: i32) -> i32 {
    container
        .ports
        .as_ref()
        .and_then(|ports| ports.iter().find(|p| p.name.as_deref() == Some(name)))
        .map(|p| p.container_port)
        .unwrap_or(default)
}

/// True when the pod phase is Running and its Ready condition is True
pub fn is_pod_running_and_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}
