/// Architecture rules for sizing a parallel region.
/// Decides how many lanes join a team given the one-shot request, the
/// requested-threads ICV, the thread limit and the lanes the launch provides.
/// On Volta and newer NVIDIA parts every lane of a warp has to participate,
/// so teams smaller than the launch are rounded down to whole warps.
use serde::{Deserialize, Serialize};

use crate::warp::{MAX_SIMD_WIDTH, WARP_SIZE};

/// SIMD-group rules of a specific device architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchConfig {
    pub name: String,
    /// Lanes per SIMD group (power of two)
    pub simd_width: u32,
    /// Whether partial-warp teams are disallowed
    pub full_group_activation: bool,
}

impl ArchConfig {
    /// Volta (sm_70) and newer: independent thread scheduling, full-warp teams.
    pub fn volta() -> Self {
        ArchConfig {
            name: "sm_70".to_string(),
            simd_width: WARP_SIZE,
            full_group_activation: true,
        }
    }

    /// Pascal (sm_60): any team size is legal.
    pub fn pascal() -> Self {
        ArchConfig {
            name: "sm_60".to_string(),
            simd_width: WARP_SIZE,
            full_group_activation: false,
        }
    }

    /// AMD CDNA (gfx90a): 64-wide wavefronts.
    pub fn wave64() -> Self {
        ArchConfig {
            name: "gfx90a".to_string(),
            simd_width: MAX_SIMD_WIDTH,
            full_group_activation: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.simd_width.is_power_of_two() && self.simd_width <= MAX_SIMD_WIDTH
    }
}

/// Which input determined the team size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamSizeLimiter {
    AvailableLanes,
    ThreadLimit,
    Request,
    WarpRounding,
}

impl std::fmt::Display for TeamSizeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeamSizeLimiter::AvailableLanes => write!(f, "available lanes"),
            TeamSizeLimiter::ThreadLimit    => write!(f, "thread limit"),
            TeamSizeLimiter::Request        => write!(f, "num_threads request"),
            TeamSizeLimiter::WarpRounding   => write!(f, "warp rounding"),
        }
    }
}

/// Inputs of one sizing decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingRequest {
    /// Pending `num_threads` clause (0 = none)
    pub num_threads_clause: u32,
    /// nthreads-var ICV of the current context (0 = unset)
    pub nthreads_icv: u32,
    /// thread-limit of the current context (0 = unset)
    pub thread_limit: u32,
    /// Lanes the launch configuration provides
    pub available_lanes: u32,
}

/// Number of lanes that participate in the next parallel region.
/// A pending clause overrides the ICV; both are capped by the thread limit
/// and the available lanes. Returns 0 only when no lane is available.
pub fn determine_team_size(req: &SizingRequest, arch: &ArchConfig) -> (u32, TeamSizeLimiter) {
    let requested = if req.num_threads_clause != 0 {
        req.num_threads_clause
    } else {
        req.nthreads_icv
    };

    let (mut num_threads, mut limiter) =
        if req.thread_limit != 0 && req.thread_limit < req.available_lanes {
            (req.thread_limit, TeamSizeLimiter::ThreadLimit)
        } else {
            (req.available_lanes, TeamSizeLimiter::AvailableLanes)
        };

    if requested != 0 && requested < num_threads {
        num_threads = requested;
        limiter = TeamSizeLimiter::Request;
    }

    if arch.full_group_activation && num_threads > 0 && num_threads < req.available_lanes {
        let rounded = round_to_groups(num_threads, arch.simd_width);
        if rounded != num_threads {
            num_threads = rounded;
            limiter = TeamSizeLimiter::WarpRounding;
        }
    }

    (num_threads, limiter)
}

/// Round down to a multiple of the SIMD width; below one group, a single lane.
fn round_to_groups(n: u32, width: u32) -> u32 {
    if n < width { 1 } else { n & !(width - 1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(clause: u32, limit: u32, available: u32) -> SizingRequest {
        SizingRequest {
            num_threads_clause: clause,
            nthreads_icv: 0,
            thread_limit: limit,
            available_lanes: available,
        }
    }

    #[test]
    fn clause_of_33_rounds_on_volta_only() {
        let (n, _) = determine_team_size(&req(33, 0, 64), &ArchConfig::pascal());
        assert_eq!(n, 33);
        let (n, lim) = determine_team_size(&req(33, 0, 64), &ArchConfig::volta());
        assert_eq!(n, 32);
        assert_eq!(lim, TeamSizeLimiter::WarpRounding);
    }

    #[test]
    fn thread_limit_caps_clause() {
        let (n, lim) = determine_team_size(&req(100, 40, 96), &ArchConfig::pascal());
        assert_eq!((n, lim), (40, TeamSizeLimiter::ThreadLimit));
        let (n, lim) = determine_team_size(&req(0, 0, 96), &ArchConfig::pascal());
        assert_eq!((n, lim), (96, TeamSizeLimiter::AvailableLanes));
    }

    #[test]
    fn small_team_on_volta_is_one_lane() {
        let (n, _) = determine_team_size(&req(5, 0, 64), &ArchConfig::volta());
        assert_eq!(n, 1);
    }

    #[test]
    fn full_launch_is_never_rounded() {
        // 48 available lanes is not a multiple of 32 but uses the whole launch
        let (n, lim) = determine_team_size(&req(0, 0, 48), &ArchConfig::volta());
        assert_eq!((n, lim), (48, TeamSizeLimiter::AvailableLanes));
    }

    #[test]
    fn icv_applies_when_no_clause_pending() {
        let r = SizingRequest { nthreads_icv: 8, ..req(0, 0, 64) };
        assert_eq!(determine_team_size(&r, &ArchConfig::pascal()).0, 8);
        let r = SizingRequest { nthreads_icv: 8, ..req(16, 0, 64) };
        assert_eq!(determine_team_size(&r, &ArchConfig::pascal()).0, 16);
    }

    #[test]
    fn no_available_lanes_yields_zero() {
        assert_eq!(determine_team_size(&req(4, 0, 0), &ArchConfig::volta()).0, 0);
    }
}
