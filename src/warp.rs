/// SIMD-group (warp) primitives.
/// A warp is a fixed-width group of lanes executing in lockstep. Divergent
/// branches mask lanes out, so the runtime coordinates the lanes that are
/// still executing through bitmask arithmetic and an intra-group broadcast.
use serde::{Deserialize, Serialize};

pub const WARP_SIZE: u32 = 32; // Standard CUDA warp size

/// Widest SIMD group a `LaneMask` can describe (AMD wave64).
pub const MAX_SIMD_WIDTH: u32 = 64;

/// Set of active lanes within one SIMD group. Bit `i` is set if lane `i`
/// is executing the current control-flow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LaneMask(pub u64);

impl LaneMask {
    pub const EMPTY: LaneMask = LaneMask(0);

    /// All lanes of a group of `width` lanes.
    pub fn full(width: u32) -> Self {
        if width >= MAX_SIMD_WIDTH {
            LaneMask(u64::MAX)
        } else {
            LaneMask((1u64 << width) - 1)
        }
    }

    pub fn from_lanes<I: IntoIterator<Item = u32>>(lanes: I) -> Self {
        lanes
            .into_iter()
            .filter(|&l| l < MAX_SIMD_WIDTH)
            .fold(LaneMask::EMPTY, |m, l| m.with(l))
    }

    pub fn with(self, lane: u32) -> Self {
        LaneMask(self.0 | bit(lane))
    }

    pub fn contains(self, lane: u32) -> bool {
        self.0 & bit(lane) != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lanes strictly below `lane` (CUDA `%lanemask_lt`).
    pub fn lanemask_lt(lane: u32) -> Self {
        if lane >= MAX_SIMD_WIDTH {
            LaneMask(u64::MAX)
        } else {
            LaneMask(bit(lane) - 1)
        }
    }

    /// The subset of this mask at or above lane `k`.
    pub fn remaining_from(self, k: u32) -> Self {
        LaneMask(self.0 & !Self::lanemask_lt(k).0)
    }

    /// Lowest set lane at or above `k`, if any.
    pub fn lowest_set_from(self, k: u32) -> Option<u32> {
        let rest = self.remaining_from(k);
        if rest.is_empty() {
            None
        } else {
            Some(rest.0.trailing_zeros())
        }
    }

    /// Number of mask lanes below `lane`: the lane's rank within the mask.
    pub fn rank_of(self, lane: u32) -> u32 {
        (self.0 & Self::lanemask_lt(lane).0).count_ones()
    }

    /// Iterate set lanes in ascending order.
    pub fn lanes(self) -> impl Iterator<Item = u32> {
        (0..MAX_SIMD_WIDTH).filter(move |&l| self.contains(l))
    }
}

impl std::fmt::Display for LaneMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

fn bit(lane: u32) -> u64 {
    1u64.checked_shl(lane).unwrap_or(0)
}

/// One SIMD group of a block, addressed by its index within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Warp {
    pub id: u32,
    pub width: u32,
}

impl Warp {
    pub fn new(id: u32, width: u32) -> Self {
        Warp { id, width }
    }

    /// Warp that contains hardware lane `hw_lane` of the block.
    pub fn containing(hw_lane: u32, width: u32) -> Self {
        Warp::new(hw_lane / width, width)
    }

    /// Hardware (block-relative) index of the warp's lane 0.
    pub fn first_lane(&self) -> u32 {
        self.id * self.width
    }

    pub fn hw_lane(&self, lane: u32) -> u32 {
        self.first_lane() + lane
    }

    /// Broadcast `values[src]` to every lane of `mask` (CUDA `__shfl_sync`).
    /// `values` is indexed by lane within the warp. Reading from a lane that
    /// is not part of `mask` is undefined on hardware and yields `None` here.
    pub fn shfl_sync(&self, mask: LaneMask, values: &[u32], src: u32) -> Option<u32> {
        if !mask.contains(src) {
            return None;
        }
        values.get(src as usize).copied()
    }
}
