//! envflow control plane
//!
//! Drives environment and domain provisioning and streams progress back to
//! the caller.
//!
//! ```text
//!   caller ──► ControlPlane ──spawn──► workflow task
//!                  │                      │  step by step:
//!                  │                      ├─► AddressAllocator (block choice)
//!                  │                      ├─► CloudApi         (VPC, gateway, ...)
//!                  │                      ├─► Provisioner      (terraform)
//!                  │                      └─► RecordStore      (persist each step)
//!                  ▼
//!            ProgressStream ◄── Progress(..)* then Done | Failure(err)
//!                  │
//!                relay ──► text frames, then one close frame
//! ```

pub mod allocator;
mod apps;
pub mod controlplane;
pub mod domain;
pub mod environment;
pub mod error;
pub mod progress;
pub mod relay;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use allocator::{AddressAllocator, BlockSource, CloudAndStoreBlocks, Reservation};
pub use controlplane::{ControlPlane, Settings};
pub use domain::validate_domain_name;
pub use environment::{
    CreateEnvironment, ENVIRONMENT_PREFIXES, EXECUTION_ROLE_NAME, Step, compute_subnet,
    validate_name,
};
pub use error::{CloseCode, ControlPlaneError, Result};
pub use progress::{ProgressEvent, ProgressSender, ProgressStream, channel};
pub use relay::{Frame, MAX_CLOSE_REASON, relay};
