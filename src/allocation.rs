use serde::Serialize;

use crate::domain::ClassCounts;

/// System-wide ceiling on customer records sharing one decrypted login.
pub const MAX_SHARES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The login already has `MAX_SHARES` records somewhere in the system.
    GlobalCapReached,
    /// Every slot the credential grants on its server is taken.
    LocallySaturated,
    NoSlotsLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Available(ClassCounts),
    Excluded(ExclusionReason),
}

impl Allocation {
    pub fn available(&self) -> Option<ClassCounts> {
        match self {
            Self::Available(counts) => Some(*counts),
            Self::Excluded(_) => None,
        }
    }
}

/// Free slots per class for one credential group.
///
/// - The global cap is checked before any local numbers, since a credential can be locally
///   under capacity yet globally saturated.
/// - When the per-class numbers would admit more new customers than the global cap leaves,
///   they are scaled down: class `A` is floored, class `B` takes the remainder, so the two
///   always sum to exactly the global remainder.
/// - The same scaling bounds the sum by the credential's remaining local total, which only
///   differs from the per-class sum when one class is already overfilled.
pub fn allocate(capacity: ClassCounts, used: ClassCounts, global_usage: u32) -> Allocation {
    if global_usage >= MAX_SHARES {
        return Allocation::Excluded(ExclusionReason::GlobalCapReached);
    }
    if used.total() >= capacity.total() {
        return Allocation::Excluded(ExclusionReason::LocallySaturated);
    }

    let mut available = ClassCounts::new(
        capacity.a.saturating_sub(used.a),
        capacity.b.saturating_sub(used.b),
    );
    let sum = available.total();
    if sum == 0 {
        return Allocation::Excluded(ExclusionReason::NoSlotsLeft);
    }

    let global_remaining = MAX_SHARES - global_usage;
    let local_remaining = capacity.total() - used.total();
    let bound = global_remaining.min(local_remaining);
    if sum > bound {
        available = scale_to(available, bound);
    }

    if available.is_zero() {
        return Allocation::Excluded(ExclusionReason::NoSlotsLeft);
    }
    Allocation::Available(available)
}

/// Shrink `available` so it sums to `target` (< its current sum).
fn scale_to(available: ClassCounts, target: u32) -> ClassCounts {
    let sum = available.total();
    // floor(a * target / sum) is floor(a * ratio) without float error.
    let a = u64::from(available.a) * u64::from(target) / u64::from(sum);
    let a = a as u32;
    ClassCounts::new(a, target - a)
}
