//! Terraform error types

use crate::executor::Action;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerraformError {
    #[error("terraform binary not found: {0}")]
    BinaryNotFound(String),

    #[error("terraform init failed: {0}")]
    Init(String),

    #[error("terraform apply failed: {0}")]
    Apply(String),

    #[error("terraform destroy failed: {0}")]
    Destroy(String),

    #[error("terraform output failed: {0}")]
    Output(String),

    #[error("terraform {action} timed out after {timeout:?}")]
    Timeout { action: Action, timeout: Duration },

    #[error("terraform {0} was cancelled")]
    Cancelled(Action),

    #[error("could not parse terraform outputs: {0}")]
    OutputParse(String),

    #[error("invalid document parameter: {0}")]
    InvalidParameter(String),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TerraformError>;
