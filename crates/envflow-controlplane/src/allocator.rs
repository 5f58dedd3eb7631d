//! Address allocation transaction
//!
//! Choosing a block for a new environment is a read-modify-write over the
//! address space in use: the cloud's existing networks, the blocks recorded on
//! stored environments, and blocks handed out to creations that have not
//! persisted them yet. [`AddressAllocator`] runs snapshot and choice under one
//! lock and keeps the chosen block reserved until the [`Reservation`] drops.

use crate::error::{ControlPlaneError, Result};
use async_trait::async_trait;
use envflow_cloud::{CloudApi, CloudError, Environment, Ipv4Block, RecordStore, next_block};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Source of the address blocks already in use
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn used_blocks(&self) -> Result<Vec<Ipv4Block>>;
}

/// Existing cloud networks plus blocks recorded on stored environments
pub struct CloudAndStoreBlocks {
    cloud: Arc<dyn CloudApi>,
    store: Arc<dyn RecordStore>,
}

impl CloudAndStoreBlocks {
    pub fn new(cloud: Arc<dyn CloudApi>, store: Arc<dyn RecordStore>) -> Self {
        Self { cloud, store }
    }
}

#[async_trait]
impl BlockSource for CloudAndStoreBlocks {
    async fn used_blocks(&self) -> Result<Vec<Ipv4Block>> {
        let mut blocks = self
            .cloud
            .network_blocks()
            .await
            .map_err(|e| ControlPlaneError::step("describe networks", e))?;

        let environments = self
            .store
            .list_records::<Environment>()
            .await
            .map_err(ControlPlaneError::Store)?;
        blocks.extend(environments.iter().filter_map(|env| env.cidr_block));

        Ok(blocks)
    }
}

/// Fixed set of used blocks
#[async_trait]
impl BlockSource for Vec<Ipv4Block> {
    async fn used_blocks(&self) -> Result<Vec<Ipv4Block>> {
        Ok(self.clone())
    }
}

type Reserved = Arc<Mutex<BTreeSet<Ipv4Block>>>;

/// Serializes block allocation within one control plane
pub struct AddressAllocator {
    source: Arc<dyn BlockSource>,
    super_block: Ipv4Block,
    prefix: u8,
    lock: tokio::sync::Mutex<()>,
    reserved: Reserved,
}

impl AddressAllocator {
    pub fn new(source: Arc<dyn BlockSource>, super_block: Ipv4Block, prefix: u8) -> Self {
        Self {
            source,
            super_block,
            prefix,
            lock: tokio::sync::Mutex::new(()),
            reserved: Arc::default(),
        }
    }

    /// Reserve the lowest free block
    pub async fn allocate(&self) -> Result<Reservation> {
        let _guard = self.lock.lock().await;

        let mut used = self.source.used_blocks().await?;
        used.extend(
            self.reserved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied(),
        );

        let block = next_block(&used, self.super_block, self.prefix).map_err(|e| match e {
            CloudError::AddressSpaceExhausted {
                super_block,
                prefix,
            } => ControlPlaneError::AddressSpaceExhausted {
                super_block,
                prefix,
            },
            other => ControlPlaneError::Config(other.to_string()),
        })?;

        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(block);
        tracing::debug!(%block, in_use = used.len(), "Reserved address block");

        Ok(Reservation {
            block,
            reserved: Arc::clone(&self.reserved),
        })
    }
}

/// A block held back from other allocations until dropped
#[derive(Debug)]
pub struct Reservation {
    block: Ipv4Block,
    reserved: Reserved,
}

impl Reservation {
    pub fn block(&self) -> Ipv4Block {
        self.block
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envflow_cloud::{DEFAULT_ENVIRONMENT_PREFIX, DEFAULT_SUPER_BLOCK};

    fn block(s: &str) -> Ipv4Block {
        s.parse().unwrap()
    }

    fn allocator(used: Vec<Ipv4Block>) -> AddressAllocator {
        AddressAllocator::new(
            Arc::new(used),
            DEFAULT_SUPER_BLOCK,
            DEFAULT_ENVIRONMENT_PREFIX,
        )
    }

    #[tokio::test]
    async fn test_allocates_lowest_free_block() {
        let allocator = allocator(vec![block("10.0.0.0/16"), block("10.2.0.0/16")]);
        let reservation = allocator.allocate().await.unwrap();
        assert_eq!(reservation.block(), block("10.1.0.0/16"));
    }

    #[tokio::test]
    async fn test_reservations_are_not_handed_out_twice() {
        let allocator = allocator(Vec::new());

        let first = allocator.allocate().await.unwrap();
        let second = allocator.allocate().await.unwrap();
        assert_eq!(first.block(), block("10.0.0.0/16"));
        assert_eq!(second.block(), block("10.1.0.0/16"));

        drop(first);
        let third = allocator.allocate().await.unwrap();
        assert_eq!(third.block(), block("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_do_not_overlap() {
        let allocator = Arc::new(allocator(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move { allocator.allocate().await.unwrap() })
            })
            .collect();

        let mut blocks = BTreeSet::new();
        let mut reservations = Vec::new();
        for handle in handles {
            let reservation = handle.await.unwrap();
            assert!(blocks.insert(reservation.block()));
            reservations.push(reservation);
        }
        assert_eq!(blocks.len(), 8);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let allocator = allocator(vec![DEFAULT_SUPER_BLOCK]);
        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(
            err,
            ControlPlaneError::AddressSpaceExhausted { prefix: 16, .. }
        ));
    }
}
