//! HTTP clients for the per-cluster Ray endpoints
//!
//! Both clients are consumed by the controller through traits so tests can
//! substitute mocks; the real implementations speak plain HTTP via reqwest.

mod dashboard;
mod proxy;

pub use dashboard::{
    RestServeDashboardClient, ServeApplicationStatus, ServeDashboardClient, ServeDeploymentDetail,
};
pub use proxy::{HeadProxyClient, RestHeadProxyClient};

#[cfg(test)]
pub use dashboard::MockServeDashboardClient;
#[cfg(test)]
pub use proxy::MockHeadProxyClient;
