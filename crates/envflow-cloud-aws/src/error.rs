//! AWS provider error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("{operation} failed: {message}")]
    Api { operation: &'static str, message: String },

    #[error("{operation} returned no {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    #[error("VPC {0} has no main route table")]
    NoMainRouteTable(String),

    #[error("VPC {vpc_id} reports an invalid CIDR block: {cidr}")]
    InvalidCidr { vpc_id: String, cidr: String },
}

impl From<AwsError> for envflow_cloud::CloudError {
    fn from(err: AwsError) -> Self {
        envflow_cloud::CloudError::ApiError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AwsError>;
