//! Cloud API abstraction
//!
//! The environment state machine talks to the cloud exclusively through
//! [`CloudApi`]. The production implementation lives in `envflow-cloud-aws`;
//! tests substitute a scripted fake.

use crate::cidr::Ipv4Block;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Operations needed to build the network and compute foundation of an
/// environment.
///
/// Every call is a single request to the provider. Retrying transient failures
/// is the implementation's concern (see [`RetryConfig`]); callers treat any
/// returned error as final.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Returns the provider name (e.g., "aws")
    fn name(&self) -> &str;

    /// Address blocks of every virtual network that currently exists
    async fn network_blocks(&self) -> Result<Vec<Ipv4Block>>;

    /// Create a virtual network and return its id
    async fn create_network(&self, name: &str, block: Ipv4Block) -> Result<String>;

    /// Create an internet gateway and return its id
    async fn create_internet_gateway(&self, name: &str) -> Result<String>;

    async fn attach_internet_gateway(&self, gateway_id: &str, network_id: &str) -> Result<()>;

    /// Add a `0.0.0.0/0` route through the gateway to the network's main route
    /// table and return the route table id
    async fn create_default_route(&self, network_id: &str, gateway_id: &str) -> Result<String>;

    /// Create a subnet and return its id
    async fn create_subnet(&self, name: &str, network_id: &str, block: Ipv4Block)
        -> Result<String>;

    /// Make sure the shared task execution role exists and return its name.
    ///
    /// The role is shared by all environments, so an existing role is not an
    /// error.
    async fn ensure_execution_role(&self, role_name: &str) -> Result<String>;

    /// Create a compute cluster and return its id
    async fn create_cluster(&self, name: &str) -> Result<String>;
}

/// Retry configuration handed to the cloud client
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}
