//! Control plane error types
//!
//! Every failure ends a progress stream with exactly one error. How the
//! transport closes the connection follows from [`ControlPlaneError::close_code`].

use envflow_cloud::{CloudError, Ipv4Block};
use envflow_terraform::TerraformError;
use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// Malformed or incomplete request, rejected before any side effect
    #[error("invalid request: {0}")]
    Validation(String),

    /// The request collides with an existing or in-flight resource
    #[error("conflict: {0}")]
    Conflict(String),

    /// A cloud API or provisioning tool call failed
    #[error("{step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: BoxError,
    },

    #[error("address space exhausted: no free /{prefix} block left in {super_block}")]
    AddressSpaceExhausted { super_block: Ipv4Block, prefix: u8 },

    #[error("cancelled during {0}")]
    Cancelled(String),

    #[error("record store error: {0}")]
    Store(#[source] CloudError),

    #[error("configuration error: {0}")]
    Config(String),

    /// The producer went away without reporting an outcome
    #[error("operation ended without reporting a result")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

impl ControlPlaneError {
    /// Wrap an external dependency failure with the step that raised it
    pub fn step(step: impl fmt::Display, source: impl Into<BoxError>) -> Self {
        ControlPlaneError::Step {
            step: step.to_string(),
            source: source.into(),
        }
    }

    /// Like [`ControlPlaneError::step`], but a cancelled tool run stays a cancellation
    pub fn terraform(step: impl fmt::Display, err: TerraformError) -> Self {
        match err {
            TerraformError::Cancelled(_) => ControlPlaneError::Cancelled(step.to_string()),
            other => ControlPlaneError::step(step, other),
        }
    }

    pub fn close_code(&self) -> CloseCode {
        match self {
            ControlPlaneError::Validation(_) => CloseCode::InvalidRequest,
            ControlPlaneError::Conflict(_) => CloseCode::PolicyViolation,
            _ => CloseCode::InternalError,
        }
    }
}

/// Status carried by the closure signal of a progress connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    PolicyViolation,
    InternalError,
    /// Unauthenticated or invalid request
    InvalidRequest,
}

impl CloseCode {
    /// WebSocket close status
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::PolicyViolation => 1008,
            CloseCode::InternalError => 1011,
            CloseCode::InvalidRequest => 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envflow_terraform::Action;

    #[test]
    fn test_close_codes() {
        assert_eq!(
            ControlPlaneError::Validation("bad".into()).close_code().code(),
            3000
        );
        assert_eq!(
            ControlPlaneError::Conflict("dup".into()).close_code().code(),
            1008
        );
        assert_eq!(
            ControlPlaneError::step("create VPC", CloudError::ApiError("boom".into()))
                .close_code()
                .code(),
            1011
        );
        assert_eq!(CloseCode::Normal.code(), 1000);
    }

    #[test]
    fn test_step_message_names_step() {
        let err = ControlPlaneError::step("create subnet", CloudError::ApiError("quota".into()));
        assert_eq!(err.to_string(), "create subnet failed: API error: quota");
    }

    #[test]
    fn test_cancelled_tool_run() {
        let err = ControlPlaneError::terraform(
            "destroy environment",
            TerraformError::Cancelled(Action::Destroy),
        );
        assert!(matches!(err, ControlPlaneError::Cancelled(ref s) if s == "destroy environment"));
    }
}
