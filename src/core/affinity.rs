//! Priority tables and core-count-tiered affinity policy

use crate::platform::{AffinityMask, IoPriority, PagePriority, PriorityClass};

/// The two ways a process group is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Boost,
    Throttle,
}

/// Scheduling, I/O and paging priority applied together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityProfile {
    pub class: PriorityClass,
    pub io: IoPriority,
    pub page: PagePriority,
}

pub const BOOST_PROFILE: PriorityProfile = PriorityProfile {
    class: PriorityClass::High,
    io: IoPriority::Normal,
    page: PagePriority::Normal,
};

pub const THROTTLE_PROFILE: PriorityProfile = PriorityProfile {
    class: PriorityClass::BelowNormal,
    io: IoPriority::VeryLow,
    page: PagePriority::VeryLow,
};

impl Policy {
    pub fn profile(&self) -> PriorityProfile {
        match self {
            Policy::Boost => BOOST_PROFILE,
            Policy::Throttle => THROTTLE_PROFILE,
        }
    }

    /// Affinity for `logical_cores` cores.
    ///
    /// | cores | boost        | throttle          |
    /// |-------|--------------|-------------------|
    /// | >= 8  | 1..N-1       | 0 and N-3..N-1    |
    /// | 4     | 0..3         | 0, 3              |
    /// | 2     | 0, 1         | 1                 |
    /// | other | all          | 0                 |
    pub fn mask(&self, logical_cores: usize) -> AffinityMask {
        let n = logical_cores.clamp(1, 64);
        match (self, n) {
            (Policy::Boost, n) if n >= 8 => AffinityMask::from_cores(1..n),
            (Policy::Throttle, n) if n >= 8 => {
                AffinityMask::from_cores(std::iter::once(0).chain(n - 3..n))
            }
            (Policy::Boost, 4) => AffinityMask::all(4),
            (Policy::Throttle, 4) => AffinityMask::from_cores([0, 3]),
            (Policy::Boost, 2) => AffinityMask::all(2),
            (Policy::Throttle, 2) => AffinityMask::from_cores([1]),
            (Policy::Boost, n) => AffinityMask::all(n),
            (Policy::Throttle, _) => AffinityMask::from_cores([0]),
        }
    }
}

/// Cores reserved for GPU interrupts on machines with at least four physical
/// cores: the top four logical cores with SMT, otherwise the top two physical.
pub fn isolated_cores(logical: usize, physical: usize) -> Vec<usize> {
    if physical < 4 {
        return Vec::new();
    }
    if logical > physical {
        (logical.saturating_sub(4)..logical).collect()
    } else {
        (physical - 2..physical).collect()
    }
}
