//! Error types for the RayService operator

use thiserror::Error;

/// Main error type for RayService reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for the RayService spec
    #[error("validation error: {0}")]
    Validation(String),

    /// Ray dashboard request failed
    #[error("dashboard error: {0}")]
    Dashboard(String),

    /// Serialization/deserialization error (serve config, spec hashing)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An owned object is in a state the reconciler cannot work with
    #[error("cluster state error: {0}")]
    ClusterState(String),

    /// A computed status value does not fit its CRD field
    #[error("status error: {0}")]
    Status(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a dashboard error with the given message
    pub fn dashboard(msg: impl Into<String>) -> Self {
        Self::Dashboard(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a cluster state error with the given message
    pub fn cluster_state(msg: impl Into<String>) -> Self {
        Self::ClusterState(msg.into())
    }

    /// Create a status error with the given message
    pub fn status(msg: impl Into<String>) -> Self {
        Self::Status(msg.into())
    }

    /// True when the underlying Kubernetes API error is AlreadyExists.
    ///
    /// Creation races with a concurrent reconcile of the same Service object
    /// are benign; callers treat this as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.reason == "AlreadyExists")
    }

    /// True when the underlying Kubernetes API error is NotFound
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.reason == "NotFound" || ae.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: spec validation catches misconfigurations before any cluster work
    ///
    /// When a user sets fields the operator owns (like the head service name)
    /// or an unknown upgrade strategy, the error message names the field.
    #[test]
    fn story_validation_errors_name_the_offending_field() {
        let err = Error::validation("spec.rayClusterConfig.headGroupSpec.headService.metadata.name should not be set");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("headService"));

        let err = Error::validation("spec.upgradeStrategy.type value Rolling is invalid");
        assert!(err.to_string().contains("Rolling"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("expected Validation variant"),
        }
    }

    /// Story: dashboard failures point the operator at the dashboard, not Serve
    ///
    /// A failed status poll means we could not observe the applications at
    /// all; the message keeps the distinction visible in logs.
    #[test]
    fn story_dashboard_errors_are_distinguishable() {
        let err = Error::dashboard("failed to get Serve application statuses: connection refused");
        assert!(err.to_string().contains("dashboard error"));
        assert!(err.to_string().contains("connection refused"));
    }

    /// Story: error helpers accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let cluster = "svc-raycluster-abcde";
        let err = Error::cluster_state(format!("found 0 head pods for cluster {cluster}"));
        assert!(err.to_string().contains("svc-raycluster-abcde"));

        let err = Error::serialization("serve config is not a YAML mapping");
        assert!(err.to_string().contains("YAML mapping"));
    }

    /// Story: AlreadyExists from a create race is detected for benign handling
    #[test]
    fn story_already_exists_detection() {
        let not_race = Error::validation("nope");
        assert!(!not_race.is_already_exists());

        let ae = kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "services \"a-serve-svc\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        };
        let race = Error::Kube(kube::Error::Api(ae));
        assert!(race.is_already_exists());
    }
}
