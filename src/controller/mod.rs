//! RayService controller reconciliation logic
//!
//! The reconcile driver lives in [`rayservice`]; the Serve application
//! reconciler in [`serve`]; the front-door Service reconciler in
//! [`services`]; cluster API access in [`api`].

mod api;
mod rayservice;
mod serve;
mod services;

pub use api::{KubeRayApi, RayApi};
pub use rayservice::{
    decide_cluster_action, error_policy, reconcile, ClusterAction, ClusterSlots, Context,
};
pub use services::ServiceKind;

use crate::crd::{RayService, RayServiceStatuses};

/// Status accessor used across the controller modules.
///
/// The status subresource is optional on the wire; the reconciler normalizes
/// it to a default value on first touch so downstream code never branches on
/// its absence.
pub(crate) fn status_mut(ray_service: &mut RayService) -> &mut RayServiceStatuses {
    ray_service.status.get_or_insert_with(Default::default)
}
