//! Cloud layer error types

use crate::cidr::Ipv4Block;
use thiserror::Error;

/// Errors raised by the cloud layer: address math, record storage and the
/// cloud API itself.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("No free /{prefix} block left in {super_block}")]
    AddressSpaceExhausted { super_block: Ipv4Block, prefix: u8 },

    #[error("Record store error: {0}")]
    StoreError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;
