//! Head-pod Serve proxy health probe
//!
//! The head pod only belongs in the serve service while its HTTP proxy actor
//! answers health checks. The controller probes the proxy directly over the
//! pod IP once per tick and labels the pod accordingly.

use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Health endpoint exposed by the Serve HTTP proxy actor
const PROXY_HEALTH_PATH: &str = "/-/healthz";

/// Probe timeout; an unhealthy proxy commonly just hangs
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Health probe against a head pod's Serve proxy actor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HeadProxyClient: Send + Sync {
    /// Ok when the proxy actor on `host_ip:port` reports healthy
    async fn check_proxy_actor_health(&self, host_ip: &str, port: i32) -> Result<(), Error>;
}

/// Real probe speaking HTTP to the pod IP
pub struct RestHeadProxyClient {
    http: reqwest::Client,
}

impl RestHeadProxyClient {
    /// Build a probe client with the standard timeout
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::dashboard(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HeadProxyClient for RestHeadProxyClient {
    async fn check_proxy_actor_health(&self, host_ip: &str, port: i32) -> Result<(), Error> {
        let url = format!("http://{host_ip}:{port}{PROXY_HEALTH_PATH}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::dashboard(format!("proxy health probe failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::dashboard(format!(
                "proxy actor health probe returned {status}"
            )));
        }
        Ok(())
    }
}
