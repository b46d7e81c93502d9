//! RayService operator - zero-downtime lifecycle management for Ray Serve on Kubernetes
//!
//! The operator drives a declarative RayService resource toward a running,
//! healthy Ray cluster with a Serve application deployed on it. At most two
//! clusters exist per service at a time: an active one receiving traffic and
//! an optional pending one being prepared as an upgrade target. Upgrades are
//! always "new cluster, then switch": the pending cluster is created from the
//! new spec, its Serve applications are validated against the dashboard, and
//! only then is traffic swapped by repointing the front-door Services.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (RayService, RayCluster)
//! - [`controller`] - reconcile driver, cluster lifecycle planner, Serve
//!   reconciler, network-service reconciler
//! - [`clients`] - Ray dashboard REST client and head-pod proxy probe
//! - [`cache`] - serve-config cache and dangling-cluster deletion schedule
//! - [`util`] - canonical spec hashing, name generation, env toggles
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod cache;
pub mod clients;
pub mod controller;
pub mod crd;
pub mod error;
pub mod util;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

// =============================================================================
// Timing constants
// =============================================================================

/// Every reconcile tick re-queues itself after this delay.
pub const SERVICE_DEFAULT_REQUEUE: Duration = Duration::from_secs(2);

/// Grace period between first observing a dangling RayCluster and deleting it.
///
/// Absorbs brief scheduling oscillations (a just-demoted cluster the next
/// reconcile would otherwise re-adopt) and gives consumers time to drain.
pub const RAY_CLUSTER_DELETION_DELAY: Duration = Duration::from_secs(60);

/// Default capacity of the serve-config LRU cache (RayService entries).
pub const DEFAULT_SERVE_CONFIG_CACHE_CAPACITY: usize = 1000;

// =============================================================================
// Environment variables
// =============================================================================

/// Setting this to "false" (case-insensitive) disables zero-downtime cluster
/// rollout. `spec.upgradeStrategy.type` takes precedence when set.
pub const ENABLE_ZERO_DOWNTIME_ENV: &str = "ENABLE_ZERO_DOWNTIME";

/// Setting this to "true" reconciles the front-door Services even before the
/// Serve applications are ready, so operators can route traffic early.
pub const EAGER_EXPOSES_SERVICES_ENV: &str = "ENABLE_RAYSERVICE_EAGER_EXPOSES_SERVICES";

// =============================================================================
// Labels and annotations written on owned objects
// =============================================================================

/// Label selecting pods (and Services) of a particular RayCluster.
pub const RAY_CLUSTER_LABEL_KEY: &str = "ray.io/cluster";

/// Label distinguishing head from worker pods.
pub const RAY_NODE_TYPE_LABEL_KEY: &str = "ray.io/node-type";

/// `ray.io/node-type` value carried by head pods.
pub const RAY_NODE_TYPE_HEAD: &str = "head";

/// Label on owned RayClusters naming the RayService they originate from.
pub const RAY_ORIGINATED_FROM_CR_NAME_LABEL_KEY: &str = "ray.io/originated-from-cr-name";

/// Label on owned RayClusters naming the originating CRD kind.
pub const RAY_ORIGINATED_FROM_CRD_LABEL_KEY: &str = "ray.io/originated-from-crd";

/// `ray.io/originated-from-crd` value for clusters owned by a RayService.
pub const RAY_ORIGINATED_FROM_RAY_SERVICE: &str = "RayService";

/// Label on head pods marking serve-service membership ("true" / "false").
pub const RAY_SERVING_SERVICE_LABEL_KEY: &str = "ray.io/serve";

/// Annotation holding the canonical hash of the cluster spec with
/// autoscaler-mutable fields elided.
pub const HASH_WITHOUT_REPLICAS_AND_WORKERS_TO_DELETE_KEY: &str =
    "ray.io/hash-without-replicas-and-workers-to-delete";

/// Annotation holding the worker-group count at cluster creation time.
pub const NUM_WORKER_GROUPS_KEY: &str = "ray.io/num-worker-groups";

/// Annotation holding the operator version that created the cluster.
pub const KUBERAY_VERSION_KEY: &str = "ray.io/kuberay-version";

/// Operator version stamped into [`KUBERAY_VERSION_KEY`].
pub const KUBERAY_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Ports and naming
// =============================================================================

/// Name of the dashboard port on head services.
pub const DASHBOARD_PORT_NAME: &str = "dashboard";

/// Default Ray dashboard port.
pub const DEFAULT_DASHBOARD_PORT: i32 = 8265;

/// Name of the Serve proxy port on head/worker containers.
pub const SERVING_PORT_NAME: &str = "serve";

/// Default Serve proxy port.
pub const DEFAULT_SERVING_PORT: i32 = 8000;

/// Application name substituted when the dashboard reports an unnamed app.
pub const DEFAULT_SERVE_APP_NAME: &str = "default";

/// Head service name for a cluster or service: `{name}-head-svc`.
pub fn head_service_name(owner: &str) -> String {
    format!("{owner}-head-svc")
}

/// Serve service name for a RayService: `{name}-serve-svc`.
pub fn serve_service_name(owner: &str) -> String {
    format!("{owner}-serve-svc")
}
