//! RayService Custom Resource Definition
//!
//! A RayService declares a Ray cluster blueprint plus a Serve application
//! config. The operator materializes the blueprint as RayCluster objects,
//! pushes the Serve config through the cluster dashboard, and swaps traffic
//! between clusters during upgrades.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::raycluster::{RayClusterSpec, RayClusterStatus};

/// Legal values for `spec.upgradeStrategy.type`.
///
/// Kept as string constants rather than an enum: the field arrives from the
/// API server as free text and invalid values must be rejected by spec
/// validation with an event, not by a deserialization failure.
pub mod upgrade_type {
    /// Spin up a new cluster, validate it, then switch traffic.
    pub const NEW_CLUSTER: &str = "NewCluster";
    /// Never roll out a new cluster on spec drift.
    pub const NONE: &str = "None";
}

/// Serve application statuses reported by the Ray dashboard.
pub mod app_status {
    /// All deployments are up and the app accepts traffic.
    pub const RUNNING: &str = "RUNNING";
    /// Deployment in progress.
    pub const DEPLOYING: &str = "DEPLOYING";
    /// Not yet submitted.
    pub const NOT_STARTED: &str = "NOT_STARTED";
    /// Deployment failed.
    pub const DEPLOY_FAILED: &str = "DEPLOY_FAILED";
    /// The app was healthy once and has degraded.
    pub const UNHEALTHY: &str = "UNHEALTHY";
    /// Being torn down.
    pub const DELETING: &str = "DELETING";
}

/// Serve deployment statuses reported by the Ray dashboard.
pub mod deployment_status {
    /// Replicas are healthy.
    pub const HEALTHY: &str = "HEALTHY";
    /// Rollout in progress.
    pub const UPDATING: &str = "UPDATING";
    /// Replicas are failing.
    pub const UNHEALTHY: &str = "UNHEALTHY";
}

/// Specification for a RayService
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1",
    kind = "RayService",
    plural = "rayservices",
    namespaced,
    status = "RayServiceStatuses",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.serviceStatus"}"#,
    printcolumn = r#"{"name":"NumServeEndpoints","type":"integer","jsonPath":".status.numServeEndpoints"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceSpec {
    /// Blueprint for the underlying RayCluster objects. Passed through to the
    /// cluster controller; this operator only hashes a canonical projection
    /// of it to detect drift.
    pub ray_cluster_config: RayClusterSpec,

    /// Multi-application Serve config as a YAML document. Transcoded to JSON
    /// and pushed to the cluster dashboard.
    #[serde(default)]
    pub serve_config_v2: String,

    /// Upgrade strategy for cluster-level spec changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_strategy: Option<RayServiceUpgradeStrategy>,

    /// When true, the head pod is never labeled into the serve service even
    /// if its proxy actor is healthy
    #[serde(default)]
    pub exclude_head_pod_from_serve_svc: bool,
}

/// Upgrade strategy wrapper
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceUpgradeStrategy {
    /// One of [`upgrade_type::NEW_CLUSTER`] or [`upgrade_type::NONE`]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub type_: Option<String>,
}

impl RayServiceSpec {
    /// Validate the RayService specification.
    ///
    /// Fail-fast, single pass. Violations are reported by the reconciler as
    /// warning events on the resource.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(head_svc) = &self.ray_cluster_config.head_group_spec.head_service {
            if head_svc.metadata.name.as_deref().is_some_and(|n| !n.is_empty()) {
                return Err(crate::Error::validation(
                    "spec.rayClusterConfig.headGroupSpec.headService.metadata.name should not be set",
                ));
            }
        }

        if let Some(type_) = self.upgrade_strategy.as_ref().and_then(|s| s.type_.as_deref()) {
            if type_ != upgrade_type::NEW_CLUSTER && type_ != upgrade_type::NONE {
                return Err(crate::Error::validation(format!(
                    "spec.upgradeStrategy.type value {type_} is invalid, valid options are {} or {}",
                    upgrade_type::NEW_CLUSTER,
                    upgrade_type::NONE,
                )));
            }
        }

        Ok(())
    }
}

/// Top-level lifecycle state of a RayService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceStatus {
    /// The active cluster's Serve applications are all RUNNING
    Running,
    /// A pending cluster has been named and is being prepared
    Restarting,
    /// Waiting for the target cluster's Serve applications to become ready
    WaitForServeDeploymentReady,
    /// Not yet determined
    #[default]
    #[serde(rename = "")]
    Unset,
}

/// Status of a RayService, covering both cluster slots
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceStatuses {
    /// Top-level lifecycle state
    #[serde(default)]
    pub service_status: ServiceStatus,

    /// Observed state of the cluster currently receiving traffic
    #[serde(default)]
    pub active_service_status: RayServiceStatus,

    /// Observed state of the cluster being prepared as an upgrade target
    #[serde(default)]
    pub pending_service_status: RayServiceStatus,

    /// Number of pod addresses behind the serve service
    #[serde(default)]
    pub num_serve_endpoints: i32,

    /// Generation most recently seen by the reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Stamped whenever a status write is emitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
}

/// Per-slot (active or pending) observed state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceStatus {
    /// Name of the RayCluster filling this slot; empty when the slot is free
    #[serde(default)]
    pub ray_cluster_name: String,

    /// Serve applications as last reported by the cluster dashboard
    #[serde(default)]
    pub applications: BTreeMap<String, AppStatus>,

    /// Observability-only snapshot of the cluster status. Changes to this
    /// field never trigger a status write on their own.
    #[serde(default)]
    pub ray_cluster_status: RayClusterStatus,
}

/// Status of one Serve application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Dashboard-reported status string (see [`app_status`])
    #[serde(default)]
    pub status: String,

    /// Dashboard-reported detail message
    #[serde(default)]
    pub message: String,

    /// Last time the application was observed outside a sustained unhealthy
    /// state. Preserved across ticks while the app stays unhealthy so
    /// external alerting can measure the outage length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_last_update_time: Option<Time>,

    /// Per-deployment statuses within this application
    #[serde(default)]
    pub deployments: BTreeMap<String, ServeDeploymentStatus>,
}

/// Status of one Serve deployment within an application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServeDeploymentStatus {
    /// Dashboard-reported status string (see [`deployment_status`])
    #[serde(default)]
    pub status: String,

    /// Dashboard-reported detail message
    #[serde(default)]
    pub message: String,

    /// Same preservation rule as the application-level field, using the
    /// deployment UNHEALTHY state only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_last_update_time: Option<Time>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::raycluster::HeadGroupSpec;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_spec() -> RayServiceSpec {
        RayServiceSpec {
            ray_cluster_config: RayClusterSpec::default(),
            serve_config_v2: "applications:\n  - name: fruit\n    import_path: fruit.app\n"
                .to_string(),
            upgrade_strategy: None,
            exclude_head_pod_from_serve_svc: false,
        }
    }

    // =========================================================================
    // Validation stories
    // =========================================================================

    /// Story: a plain spec with no overrides passes validation
    #[test]
    fn story_default_spec_is_valid() {
        assert!(sample_spec().validate().is_ok());
    }

    /// Story: users must not name the head service themselves
    ///
    /// The operator owns head service naming; a user-set name would break the
    /// dashboard URL resolution and the selector swap on upgrade.
    #[test]
    fn story_user_set_head_service_name_fails_validation() {
        let mut spec = sample_spec();
        spec.ray_cluster_config.head_group_spec = HeadGroupSpec {
            head_service: Some(Service {
                metadata: ObjectMeta {
                    name: Some("my-head-svc".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("should not be set"));
    }

    /// Story: a head service template without a name is allowed
    ///
    /// Users may customize ports or annotations through the template as long
    /// as the name stays operator-controlled.
    #[test]
    fn story_unnamed_head_service_template_is_valid() {
        let mut spec = sample_spec();
        spec.ray_cluster_config.head_group_spec.head_service = Some(Service::default());
        assert!(spec.validate().is_ok());
    }

    /// Story: only NewCluster and None are accepted upgrade strategies
    #[test]
    fn story_upgrade_strategy_must_be_a_legal_value() {
        let mut spec = sample_spec();

        spec.upgrade_strategy = Some(RayServiceUpgradeStrategy {
            type_: Some(upgrade_type::NEW_CLUSTER.to_string()),
        });
        assert!(spec.validate().is_ok());

        spec.upgrade_strategy = Some(RayServiceUpgradeStrategy {
            type_: Some(upgrade_type::NONE.to_string()),
        });
        assert!(spec.validate().is_ok());

        spec.upgrade_strategy = Some(RayServiceUpgradeStrategy {
            type_: Some("Rolling".to_string()),
        });
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("Rolling"));
        assert!(err.to_string().contains("NewCluster"));

        // An empty wrapper with no type behaves like an absent strategy.
        spec.upgrade_strategy = Some(RayServiceUpgradeStrategy { type_: None });
        assert!(spec.validate().is_ok());
    }

    // =========================================================================
    // Serialization stories
    // =========================================================================

    /// Story: users declare a RayService in YAML
    #[test]
    fn story_yaml_manifest_parses_into_spec() {
        let yaml = r#"
rayClusterConfig:
  headGroupSpec:
    rayStartParams:
      dashboard-host: "0.0.0.0"
    template:
      spec:
        containers:
          - name: ray-head
            image: rayproject/ray:2.9.0
  workerGroupSpecs:
    - groupName: small-group
      replicas: 2
      minReplicas: 0
      maxReplicas: 5
      template:
        spec:
          containers:
            - name: ray-worker
              image: rayproject/ray:2.9.0
serveConfigV2: |
  applications:
    - name: fruit
      import_path: fruit.app
upgradeStrategy:
  type: NewCluster
"#;
        let spec: RayServiceSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.ray_cluster_config.worker_group_specs.len(), 1);
        assert_eq!(
            spec.ray_cluster_config.worker_group_specs[0].group_name,
            "small-group"
        );
        assert_eq!(
            spec.upgrade_strategy.unwrap().type_.as_deref(),
            Some("NewCluster")
        );
        assert!(spec.serve_config_v2.contains("fruit.app"));
    }

    /// Story: the unset service status serializes as the empty string
    ///
    /// A freshly created RayService has no meaningful lifecycle state yet;
    /// the CRD represents that as "" like the other cluster tooling expects.
    #[test]
    fn story_unset_service_status_is_empty_string() {
        let json = serde_json::to_string(&ServiceStatus::Unset).unwrap();
        assert_eq!(json, "\"\"");

        let parsed: ServiceStatus = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(parsed, ServiceStatus::Running);

        let status = RayServiceStatuses::default();
        assert_eq!(status.service_status, ServiceStatus::Unset);
        assert!(status.active_service_status.ray_cluster_name.is_empty());
    }
}
