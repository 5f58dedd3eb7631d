//! Task size normalization
//!
//! Container tasks can only run with a fixed set of CPU/memory combinations.
//! User-declared sizes are rounded up to the nearest supported pair.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported CPU units and, per CPU tier, the supported memory sizes in MiB.
const TIERS: &[(u32, &[u32])] = &[
    (256, &[512, 1024, 2048]),
    (512, &[1024, 2048, 3072, 4096]),
    (1024, &[2048, 3072, 4096, 5120, 6144, 7168, 8192]),
    (
        2048,
        &[
            4096, 5120, 6144, 7168, 8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384,
        ],
    ),
    (
        4096,
        &[
            8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384, 17408, 18432, 19456,
            20480, 21504, 22528, 23552, 24576, 25600, 26624, 27648, 28672, 29696, 30720,
        ],
    ),
];

/// CPU units (1024 = one vCPU) and memory in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSize {
    pub cpu: u32,
    pub memory: u32,
}

impl TaskSize {
    pub fn new(cpu: u32, memory: u32) -> Self {
        Self { cpu, memory }
    }

    /// The largest supported pair
    pub fn max() -> Self {
        let (cpu, memory) = TIERS[TIERS.len() - 1];
        Self::new(cpu, memory[memory.len() - 1])
    }

    /// Whether this exact pair is supported
    pub fn is_supported(&self) -> bool {
        TIERS
            .iter()
            .any(|(cpu, memory)| *cpu == self.cpu && memory.contains(&self.memory))
    }
}

impl fmt::Display for TaskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cpu / {} MiB", self.cpu, self.memory)
    }
}

/// How a requested CPU value that sits exactly on a tier is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundingPolicy {
    /// A CPU value equal to a tier moves up to the next tier (256 -> 512).
    #[default]
    NextTier,
    /// A CPU value equal to a tier stays on that tier (256 -> 256).
    AtLeast,
}

impl RoundingPolicy {
    fn accepts(self, tier: u32, requested: u32) -> bool {
        match self {
            RoundingPolicy::NextTier => tier > requested,
            RoundingPolicy::AtLeast => tier >= requested,
        }
    }
}

impl fmt::Display for RoundingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundingPolicy::NextTier => write!(f, "next-tier"),
            RoundingPolicy::AtLeast => write!(f, "at-least"),
        }
    }
}

impl std::str::FromStr for RoundingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "next-tier" => Ok(RoundingPolicy::NextTier),
            "at-least" => Ok(RoundingPolicy::AtLeast),
            other => Err(format!(
                "unknown rounding policy '{}' (expected next-tier or at-least)",
                other
            )),
        }
    }
}

/// Round `requested` up to the smallest supported pair that is at least as
/// large in both dimensions.
///
/// The CPU tier is chosen first according to `policy`, then memory is rounded
/// up within that tier. If the tier cannot hold the requested memory the next
/// CPU tier is tried. Requests beyond the largest tier are clamped to
/// [`TaskSize::max`].
pub fn normalize(requested: TaskSize, policy: RoundingPolicy) -> TaskSize {
    for (cpu, memory) in TIERS {
        if !policy.accepts(*cpu, requested.cpu) {
            continue;
        }
        if let Some(memory) = memory.iter().find(|m| **m >= requested.memory) {
            return TaskSize::new(*cpu, *memory);
        }
    }

    let max = TaskSize::max();
    tracing::warn!(
        requested = %requested,
        clamped = %max,
        "Requested task size exceeds the largest supported size, clamping"
    );
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_up_small_request() {
        let got = normalize(TaskSize::new(200, 300), RoundingPolicy::NextTier);
        assert_eq!(got, TaskSize::new(256, 512));
    }

    #[test]
    fn test_boundary_moves_to_next_tier() {
        let got = normalize(TaskSize::new(256, 512), RoundingPolicy::NextTier);
        assert_eq!(got, TaskSize::new(512, 1024));
    }

    #[test]
    fn test_boundary_at_least_policy() {
        let got = normalize(TaskSize::new(256, 512), RoundingPolicy::AtLeast);
        assert_eq!(got, TaskSize::new(256, 512));
    }

    #[test]
    fn test_clamps_oversized_request() {
        let got = normalize(TaskSize::new(5000, 1000), RoundingPolicy::NextTier);
        assert_eq!(got, TaskSize::max());
        assert_eq!(got, TaskSize::new(4096, 30720));
    }

    #[test]
    fn test_memory_rounds_within_tier() {
        let got = normalize(TaskSize::new(1000, 2500), RoundingPolicy::NextTier);
        assert_eq!(got, TaskSize::new(1024, 3072));
    }

    #[test]
    fn test_memory_too_large_for_tier_moves_cpu_up() {
        // 256 cpu tops out at 2048 MiB
        let got = normalize(TaskSize::new(100, 4000), RoundingPolicy::NextTier);
        assert_eq!(got, TaskSize::new(512, 4096));
    }

    #[test]
    fn test_results_are_supported() {
        for cpu in [0, 1, 255, 256, 511, 1023, 2048, 4095] {
            for memory in [0, 512, 3000, 9000, 20000] {
                for policy in [RoundingPolicy::NextTier, RoundingPolicy::AtLeast] {
                    let got = normalize(TaskSize::new(cpu, memory), policy);
                    assert!(got.is_supported(), "{} -> {}", cpu, got);
                    assert!(got.cpu >= cpu.min(4096));
                }
            }
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("next-tier".parse::<RoundingPolicy>(), Ok(RoundingPolicy::NextTier));
        assert_eq!("at-least".parse::<RoundingPolicy>(), Ok(RoundingPolicy::AtLeast));
        assert!("nearest".parse::<RoundingPolicy>().is_err());
    }
}
