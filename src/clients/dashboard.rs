//! Ray dashboard REST client
//!
//! The dashboard on each cluster's head node exposes the multi-application
//! Serve API: a PUT replaces the full set of Serve applications, a GET
//! reports their statuses. Both operations are idempotent; the controller
//! calls each at most once per reconcile tick.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Path of the multi-application Serve API on the dashboard
const SERVE_APPLICATIONS_PATH: &str = "/api/serve/applications/";

/// Per-request timeout; a hung dashboard must not stall the reconcile worker
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Status of one Serve application as reported by the dashboard
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServeApplicationStatus {
    /// Application status string (RUNNING, DEPLOYING, UNHEALTHY, ...)
    #[serde(default)]
    pub status: String,

    /// Human-readable detail, populated on failures
    #[serde(default)]
    pub message: String,

    /// Deployments within the application, by name
    #[serde(default)]
    pub deployments: HashMap<String, ServeDeploymentDetail>,
}

/// Status of one Serve deployment as reported by the dashboard
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServeDeploymentDetail {
    /// Deployment status string (HEALTHY, UPDATING, UNHEALTHY)
    #[serde(default)]
    pub status: String,

    /// Human-readable detail, populated on failures
    #[serde(default)]
    pub message: String,
}

/// Envelope of the GET response
#[derive(Debug, Default, Deserialize)]
struct ServeDetails {
    #[serde(default)]
    applications: HashMap<String, ServeApplicationStatus>,
}

/// Operations the controller performs against a cluster dashboard.
///
/// The base URL targets a specific cluster's head service and changes across
/// ticks as clusters come and go, so it is an argument rather than client
/// state; implementations are stateless and shared.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServeDashboardClient: Send + Sync {
    /// Create or update the full set of Serve applications.
    ///
    /// `config_json` is the JSON transcoding of the RayService's
    /// `serveConfigV2`. At-least-once delivery is acceptable.
    async fn update_deployments(&self, base_url: &str, config_json: &[u8]) -> Result<(), Error>;

    /// Fetch the status of every Serve application on the cluster
    async fn get_multi_application_status(
        &self,
        base_url: &str,
    ) -> Result<HashMap<String, ServeApplicationStatus>, Error>;
}

/// Real dashboard client speaking HTTP
pub struct RestServeDashboardClient {
    http: reqwest::Client,
}

impl RestServeDashboardClient {
    /// Build a client with the standard request timeout
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::dashboard(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ServeDashboardClient for RestServeDashboardClient {
    async fn update_deployments(&self, base_url: &str, config_json: &[u8]) -> Result<(), Error> {
        let url = format!("{base_url}{SERVE_APPLICATIONS_PATH}");
        let response = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(config_json.to_vec())
            .send()
            .await
            .map_err(|e| Error::dashboard(format!("UpdateDeployments request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::dashboard(format!(
                "UpdateDeployments returned {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn get_multi_application_status(
        &self,
        base_url: &str,
    ) -> Result<HashMap<String, ServeApplicationStatus>, Error> {
        let url = format!("{base_url}{SERVE_APPLICATIONS_PATH}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::dashboard(format!("GetMultiApplicationStatus request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::dashboard(format!(
                "GetMultiApplicationStatus returned {status}: {body}"
            )));
        }

        let details: ServeDetails = response
            .json()
            .await
            .map_err(|e| Error::dashboard(format!("failed to decode Serve details: {e}")))?;
        Ok(details.applications)
    }
}
