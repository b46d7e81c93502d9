//! Custom Resource Definitions for the operator
//!
//! - [`RayService`]: the declared intent reconciled by this operator
//! - [`RayCluster`]: the underlying compute cluster, provisioned by the
//!   separate RayCluster controller; this operator creates and retires
//!   instances of it but never schedules pods itself

mod raycluster;
mod rayservice;

pub use raycluster::{
    HeadGroupSpec, HeadInfo, RayCluster, RayClusterSpec, RayClusterStatus, ScaleStrategy,
    WorkerGroupSpec, HEAD_POD_READY_CONDITION,
};
pub use rayservice::{
    app_status, deployment_status, upgrade_type, AppStatus, RayService, RayServiceSpec,
    RayServiceStatus, RayServiceStatuses, RayServiceUpgradeStrategy, ServeDeploymentStatus,
    ServiceStatus,
};
