//! IPv4 CIDR blocks and the environment address allocator
//!
//! Every environment gets its own private network. Blocks are handed out from a
//! fixed super-block (by default `10.0.0.0/8`) in `/16` steps, always choosing
//! the numerically lowest block that does not overlap anything already in use.

use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Super-block environments are carved from unless configured otherwise.
pub const DEFAULT_SUPER_BLOCK: Ipv4Block = Ipv4Block {
    network: 0x0A00_0000,
    prefix: 8,
};

/// Prefix length of an environment network.
pub const DEFAULT_ENVIRONMENT_PREFIX: u8 = 16;

/// A contiguous IPv4 range in prefix notation, e.g. `10.1.0.0/16`.
///
/// The network address never has host bits set. Ordering is numeric by
/// network address, then by prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Block {
    network: u32,
    prefix: u8,
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl Ipv4Block {
    /// Build a block, rejecting prefixes above 32 and addresses with host bits set.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(CloudError::InvalidCidr(format!(
                "{}/{}: prefix must be at most 32",
                address, prefix
            )));
        }
        let network = u32::from(address);
        if network & !mask(prefix) != 0 {
            return Err(CloudError::InvalidCidr(format!(
                "{}/{}: host bits are set",
                address, prefix
            )));
        }
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn first(&self) -> u64 {
        u64::from(self.network)
    }

    fn last(&self) -> u64 {
        self.first() + self.size() - 1
    }

    /// Whether `other` lies entirely inside this block
    pub fn contains(&self, other: &Ipv4Block) -> bool {
        self.first() <= other.first() && other.last() <= self.last()
    }

    pub fn overlaps(&self, other: &Ipv4Block) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// The `index`-th block of length `new_prefix` inside this block.
    ///
    /// `10.3.0.0/16`.subnet(20, 1) is `10.3.16.0/20`.
    pub fn subnet(&self, new_prefix: u8, index: u32) -> Result<Ipv4Block> {
        if new_prefix < self.prefix || new_prefix > 32 {
            return Err(CloudError::InvalidCidr(format!(
                "cannot split {} into /{} blocks",
                self, new_prefix
            )));
        }
        let count = 1u64 << u32::from(new_prefix - self.prefix);
        if u64::from(index) >= count {
            return Err(CloudError::InvalidCidr(format!(
                "{} has only {} /{} blocks, index {} is out of range",
                self, count, new_prefix, index
            )));
        }
        let step = 1u64 << (32 - u32::from(new_prefix));
        let network = self.first() + u64::from(index) * step;
        Ok(Ipv4Block {
            network: network as u32,
            prefix: new_prefix,
        })
    }
}

impl fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv4Block {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| CloudError::InvalidCidr(format!("{}: missing prefix length", s)))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| CloudError::InvalidCidr(format!("{}: invalid address", s)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CloudError::InvalidCidr(format!("{}: invalid prefix length", s)))?;
        Ipv4Block::new(address, prefix)
    }
}

impl TryFrom<String> for Ipv4Block {
    type Error = CloudError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Block> for String {
    fn from(block: Ipv4Block) -> Self {
        block.to_string()
    }
}

/// Return the lowest `/prefix` block inside `super_block` that overlaps none of
/// `existing`.
///
/// Existing blocks may have any length and may lie partly or wholly outside the
/// super-block. The result depends only on the set of existing blocks, not on
/// their order.
pub fn next_block(existing: &[Ipv4Block], super_block: Ipv4Block, prefix: u8) -> Result<Ipv4Block> {
    if prefix < super_block.prefix || prefix > 32 {
        return Err(CloudError::InvalidCidr(format!(
            "cannot allocate /{} blocks from {}",
            prefix, super_block
        )));
    }

    let step = 1u64 << (32 - u32::from(prefix));
    let mut candidate = super_block.first();

    while candidate + step - 1 <= super_block.last() {
        let block = Ipv4Block {
            network: candidate as u32,
            prefix,
        };
        if !existing.iter().any(|b| b.overlaps(&block)) {
            tracing::debug!("Allocated {} from {}", block, super_block);
            return Ok(block);
        }
        candidate += step;
    }

    Err(CloudError::AddressSpaceExhausted {
        super_block,
        prefix,
    })
}
