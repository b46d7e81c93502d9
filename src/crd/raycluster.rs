//! RayCluster Custom Resource Definition
//!
//! RayClusters are provisioned by a separate cluster controller; this
//! operator creates, updates and retires them on behalf of a RayService and
//! reads back their status conditions. The spec here mirrors the fields the
//! lifecycle planner hashes and the worker-group append detection inspects.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set by the cluster controller once the head pod is
/// running and ready.
pub const HEAD_POD_READY_CONDITION: &str = "HeadPodReady";

/// Specification for a RayCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1",
    kind = "RayCluster",
    plural = "rayclusters",
    namespaced,
    status = "RayClusterStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterSpec {
    /// Head group configuration
    #[serde(default)]
    pub head_group_spec: HeadGroupSpec,

    /// Worker groups, in declaration order. The lifecycle planner treats
    /// appends at the tail as in-place updates and anything else as a
    /// structural change.
    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,

    /// Ray version running on the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray_version: Option<String>,

    /// Whether the in-tree autoscaler sidecar is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_in_tree_autoscaling: Option<bool>,
}

/// Head group of a RayCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    /// Optional template for the head Service. The metadata name must stay
    /// unset; the operator derives it from the cluster name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_service: Option<Service>,

    /// Service type for the head service (ClusterIP, NodePort, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// `ray start` parameters for the head node
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Pod template for the head pod
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// One worker group of a RayCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    /// Unique name of the group within the cluster
    #[serde(default)]
    pub group_name: String,

    /// Desired replica count. Mutated continuously by the autoscaler and
    /// therefore elided from the canonical spec hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Autoscaler lower bound; elided from the canonical spec hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Autoscaler upper bound; elided from the canonical spec hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// `ray start` parameters for workers in this group
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Pod template for worker pods in this group
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// Scale-down bookkeeping written by the autoscaler
    #[serde(default)]
    pub scale_strategy: ScaleStrategy,
}

/// Autoscaler scale-down strategy for a worker group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    /// Pods the autoscaler has picked for removal; elided from the canonical
    /// spec hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers_to_delete: Option<Vec<String>>,
}

/// Status reported by the cluster controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterStatus {
    /// Aggregate cluster state string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Status conditions; see [`HEAD_POD_READY_CONDITION`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Addresses of the head pod and head service
    #[serde(default)]
    pub head: HeadInfo,
}

/// Head addresses within a RayCluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadInfo {
    /// IP of the head pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    /// ClusterIP of the head service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ip: Option<String>,
}

impl RayClusterStatus {
    /// True when the cluster controller reports the head pod running and ready
    pub fn head_pod_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == HEAD_POD_READY_CONDITION && c.status == "True")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn condition(type_: &str, status: &str) -> Condition {
        Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: "Test".to_string(),
            message: String::new(),
            last_transition_time: Time(chrono::Utc::now()),
            observed_generation: None,
        }
    }

    /// Story: the serve reconciler gates on the HeadPodReady condition
    #[test]
    fn story_head_pod_ready_condition_gates_readiness() {
        let status = RayClusterStatus::default();
        assert!(!status.head_pod_ready(), "no conditions means not ready");

        let status = RayClusterStatus {
            conditions: vec![condition(HEAD_POD_READY_CONDITION, "False")],
            ..Default::default()
        };
        assert!(!status.head_pod_ready());

        let status = RayClusterStatus {
            conditions: vec![
                condition("Provisioned", "True"),
                condition(HEAD_POD_READY_CONDITION, "True"),
            ],
            ..Default::default()
        };
        assert!(status.head_pod_ready());
    }

    /// Story: worker group YAML from a cluster manifest parses with
    /// autoscaler fields intact
    #[test]
    fn story_worker_group_yaml_parses() {
        let yaml = r#"
groupName: gpu-group
replicas: 3
minReplicas: 1
maxReplicas: 8
rayStartParams:
  num-gpus: "1"
scaleStrategy:
  workersToDelete:
    - gpu-group-worker-abcde
"#;
        let group: WorkerGroupSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(group.group_name, "gpu-group");
        assert_eq!(group.replicas, Some(3));
        assert_eq!(
            group.scale_strategy.workers_to_delete.as_deref(),
            Some(&["gpu-group-worker-abcde".to_string()][..])
        );
    }
}
