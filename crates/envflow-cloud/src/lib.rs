//! envflow cloud layer
//!
//! Building blocks shared by the envflow control plane:
//!
//! - [`cidr`]: IPv4 blocks and the lowest-free-block allocator
//! - [`sizing`]: rounding of task CPU/memory to supported tiers
//! - [`model`]: environment, domain and application infrastructure records
//! - [`store`]: the record store interface and its implementations
//! - [`provider`]: the cloud API used to build environment networks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              envflow-controlplane                │
//! │      (environment / domain state machines)       │
//! └───────┬──────────────────┬──────────────────────┘
//!         │                  │
//! ┌───────▼───────┐  ┌───────▼────────┐
//! │ envflow-cloud │  │envflow-terraform│
//! │ trait CloudApi│  │  synth + exec   │
//! └───────┬───────┘  └────────────────┘
//!         │
//! ┌───────▼─────────┐
//! │envflow-cloud-aws│
//! └─────────────────┘
//! ```

pub mod cidr;
pub mod error;
pub mod model;
pub mod provider;
pub mod sizing;
pub mod store;

// Re-exports
pub use cidr::{DEFAULT_ENVIRONMENT_PREFIX, DEFAULT_SUPER_BLOCK, Ipv4Block, next_block};
pub use error::{CloudError, Result};
pub use model::{
    AppInfra, CertificateAuthority, DnsService, Domain, Environment, EnvironmentStatus,
    LoadBalancerKind, NetworkKind, OrchestratorKind, Resources,
};
pub use provider::{CloudApi, RetryConfig};
pub use sizing::{RoundingPolicy, TaskSize, normalize};
pub use store::{FileStore, MemoryStore, Record, RecordKind, RecordStore};
