//! AWS provider for envflow
//!
//! Implements [`envflow_cloud::CloudApi`] on top of the AWS SDK so the
//! control plane can build environment networks (VPC, internet gateway,
//! default route, subnet), the shared task execution role and ECS clusters.
//!
//! # Requirements
//!
//! - AWS credentials resolvable by the default provider chain
//!   (environment variables, shared config, instance profile, ...)
//!
//! # Example
//!
//! ```ignore
//! use envflow_cloud::{CloudApi, RetryConfig};
//! use envflow_cloud_aws::AwsCloud;
//!
//! let cloud = AwsCloud::connect("eu-west-1", &RetryConfig::default()).await;
//! let used = cloud.network_blocks().await?;
//! ```

pub mod error;
pub mod provider;

pub use error::{AwsError, Result};
pub use provider::AwsCloud;
