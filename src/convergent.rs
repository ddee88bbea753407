/// Convergent dispatch.
///
/// Inside divergent control flow only some lanes of a warp are executing, and
/// a block-wide barrier is unreachable. A nested simd or parallel construct
/// therefore partitions the active lanes with bitmask arithmetic: each call
/// picks the lowest unprocessed lane of the mask as the *source*, broadcasts
/// the source's pending hint to the group, and lets the first `n` lanes of the
/// mask (by rank) work on the source's behalf. Repeating the call until
/// `is_final` visits every lane of the mask exactly once as a source.
///
/// Calls operate on the whole group at once: the broadcast reads every
/// lane's hint before any lane updates its own, as the hardware does.
use tracing::{error, trace};

use crate::context::ContextId;
use crate::error::DispatchError;
use crate::parallel::BlockRuntime;
use crate::warp::{LaneMask, Warp};

/// Rolling cursor over a fixed activity mask: the lowest lane not yet used
/// as a source. Starts at lane 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneCursor(pub u32);

/// Per-lane save area for a convergent simd region.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvergentSimdJob {
    simd_limit: u32,
    saved_top: Option<ContextId>,
}

/// Per-lane save area for a convergent parallel region.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvergentParallelJob {
    num_threads: u32,
    saved_top: Option<ContextId>,
    pushed: Option<ContextId>,
}

/// One lane's view of a convergent team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergentLane {
    /// Lane index within the warp
    pub lane: u32,
    /// Hardware lane index within the block
    pub hw_lane: u32,
    /// Rank of the lane within the activity mask
    pub lane_id: u32,
    pub active: bool,
}

/// Group-uniform result of one convergent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergentTeam {
    /// Lane (within the warp) the team works for
    pub lane_source: u32,
    /// Whether `lane_source` was the last unprocessed lane of the mask
    pub is_final: bool,
    /// Team size: lanes with `lane_id < num_lanes` are active
    pub num_lanes: u32,
    /// Every lane of the mask, in ascending lane order
    pub lanes: Vec<ConvergentLane>,
}

impl ConvergentTeam {
    pub fn active(&self) -> impl Iterator<Item = &ConvergentLane> {
        self.lanes.iter().filter(|l| l.active)
    }

    pub fn active_mask(&self) -> LaneMask {
        LaneMask::from_lanes(self.active().map(|l| l.lane))
    }
}

/// A lane of the activity mask with the hint it held on entry.
struct MaskLane {
    lane: u32,
    tid: u32,
    hint: u32,
}

/// Which one-shot hint a convergent construct consumes.
#[derive(Clone, Copy)]
enum Hint {
    SimdWidth,
    NumThreads,
}

/// Job buffers cover the whole warp; checked before any lane state changes.
fn check_jobs(warp: Warp, len: usize) -> Result<(), DispatchError> {
    if len < warp.width as usize {
        error!(target: "simtomp::convergent", warp = warp.id, len, "job buffer shorter than the warp");
        return Err(DispatchError::LaneOutOfRange { lane: len as u32, limit: warp.width });
    }
    Ok(())
}

impl BlockRuntime {
    /// Shared first half of both convergent entries: choose the source,
    /// broadcast its hint, consume it on the source, size the team.
    fn convergent_team(
        &mut self,
        warp: Warp,
        mask: LaneMask,
        cursor: &mut LaneCursor,
        hint: Hint,
    ) -> Result<(ConvergentTeam, Vec<MaskLane>), DispatchError> {
        if !self.is_initialized() {
            return Err(DispatchError::RuntimeUninitialized);
        }
        let mask = LaneMask(mask.0 & LaneMask::full(warp.width).0);
        let remaining = mask.remaining_from(cursor.0);
        let Some(lane_source) = remaining.lowest_set_from(0) else {
            error!(target: "simtomp::convergent", %mask, cursor = cursor.0, "no lanes left to dispatch");
            return Err(DispatchError::NoRemainingLanes { mask, cursor: cursor.0 });
        };
        let is_final = remaining.count() == 1;
        let convergent_size = mask.count();

        // Every lane publishes its own hint before anyone reads.
        let mut members = Vec::with_capacity(convergent_size as usize);
        let mut values = vec![0u32; warp.width as usize];
        for lane in mask.lanes() {
            let tid = self.logical_tid(warp.hw_lane(lane))?;
            let value = match hint {
                Hint::SimdWidth => self.state.pending_simd_width(tid),
                Hint::NumThreads => self.state.pending_num_threads(tid),
            };
            values[lane as usize] = value;
            members.push(MaskLane { lane, tid, hint: value });
        }
        let source_value = warp
            .shfl_sync(mask, &values, lane_source)
            .ok_or(DispatchError::SourceLaneInactive { lane: lane_source })?;

        // Reset on the source only, so it does not propagate to the next construct.
        let source_tid = self.logical_tid(warp.hw_lane(lane_source))?;
        if source_value > 0 {
            match hint {
                Hint::SimdWidth => self.state.set_pending_simd_width(source_tid, 0),
                Hint::NumThreads => self.state.set_pending_num_threads(source_tid, 0),
            }
        }

        // No more lanes than are convergent.
        let num_lanes = if source_value > 0 {
            convergent_size.min(source_value)
        } else {
            convergent_size
        };

        let lanes = mask
            .lanes()
            .map(|lane| {
                let lane_id = mask.rank_of(lane);
                ConvergentLane {
                    lane,
                    hw_lane: warp.hw_lane(lane),
                    lane_id,
                    active: lane_id < num_lanes,
                }
            })
            .collect();

        cursor.0 = lane_source + 1;
        self.counters.convergent_teams += 1;
        trace!(
            target: "simtomp::convergent",
            warp = warp.id, %mask, lane_source, is_final, num_lanes,
            "convergent team"
        );
        Ok((
            ConvergentTeam { lane_source, is_final, num_lanes, lanes },
            members,
        ))
    }

    /// Enter a convergent simd region. Active lanes keep their identity but
    /// run on the source lane's task context. `jobs` is indexed by lane within
    /// the warp and must be handed back to `exit_convergent_simd`.
    pub fn enter_convergent_simd(
        &mut self,
        warp: Warp,
        mask: LaneMask,
        cursor: &mut LaneCursor,
        jobs: &mut [ConvergentSimdJob],
    ) -> Result<ConvergentTeam, DispatchError> {
        check_jobs(warp, jobs.len())?;
        let (team, members) = self.convergent_team(warp, mask, cursor, Hint::SimdWidth)?;
        let source_tid = self.logical_tid(warp.hw_lane(team.lane_source))?;
        let source_top = self.state.top(source_tid)?;

        for (m, member) in members.iter().zip(&team.lanes) {
            let Some(job) = jobs.get_mut(m.lane as usize) else {
                return Err(DispatchError::LaneOutOfRange { lane: m.lane, limit: warp.width });
            };
            job.simd_limit = m.hint;
            job.saved_top = None;
            if member.active {
                job.saved_top = Some(self.state.top(m.tid)?);
                self.state.set_top(m.tid, source_top);
            }
        }
        Ok(team)
    }

    /// Leave a convergent simd region: restore the lane's hint and context.
    pub fn exit_convergent_simd(&mut self, hw_lane: u32, job: &ConvergentSimdJob) -> Result<(), DispatchError> {
        let tid = self.logical_tid(hw_lane)?;
        self.state.set_pending_simd_width(tid, job.simd_limit);
        let saved = job.saved_top.ok_or(DispatchError::ContextUnderflow { thread: tid })?;
        self.state.set_top(tid, saved);
        Ok(())
    }

    /// Enter a convergent parallel region. Active lanes push a fresh context
    /// copied from the source lane's context, renumbered by rank in the mask.
    pub fn enter_convergent_parallel(
        &mut self,
        warp: Warp,
        mask: LaneMask,
        cursor: &mut LaneCursor,
        jobs: &mut [ConvergentParallelJob],
    ) -> Result<ConvergentTeam, DispatchError> {
        check_jobs(warp, jobs.len())?;
        let (team, members) = self.convergent_team(warp, mask, cursor, Hint::NumThreads)?;
        let source_tid = self.logical_tid(warp.hw_lane(team.lane_source))?;
        let source_top = self.state.top(source_tid)?;
        let source_ctx = self.state.context(source_top)?.clone();

        for (m, member) in members.iter().zip(&team.lanes) {
            let Some(job) = jobs.get_mut(m.lane as usize) else {
                return Err(DispatchError::LaneOutOfRange { lane: m.lane, limit: warp.width });
            };
            job.num_threads = m.hint;
            job.saved_top = None;
            job.pushed = None;
            if member.active {
                job.saved_top = Some(self.state.top(m.tid)?);
                let ctx = source_ctx.convergent(source_top, member.lane_id, team.num_lanes);
                job.pushed = Some(self.state.push(m.tid, ctx));
            }
        }
        Ok(team)
    }

    /// Leave a convergent parallel region: pop the pushed context and restore
    /// the lane's hint.
    pub fn exit_convergent_parallel(
        &mut self,
        hw_lane: u32,
        job: &ConvergentParallelJob,
    ) -> Result<(), DispatchError> {
        let tid = self.logical_tid(hw_lane)?;
        let saved = job.saved_top.ok_or(DispatchError::ContextUnderflow { thread: tid })?;
        self.state.set_top(tid, saved);
        if let Some(pushed) = job.pushed {
            self.state.arena.release(pushed);
        }
        self.state.set_pending_num_threads(tid, job.num_threads);
        Ok(())
    }

    /// Lanes of one warp must fence before relying on each other's newly
    /// published state; no block barrier exists at this scope.
    pub fn warp_fence(&mut self, warp: Warp) {
        self.counters.fences += 1;
        trace!(target: "simtomp::convergent", warp = warp.id, "memory fence");
    }

    /// Drive a convergent simd construct over `mask` to completion, calling
    /// `body` once per active lane of every sub-team. Returns the number of
    /// sub-teams.
    pub fn convergent_simd_loop<F>(&mut self, warp: Warp, mask: LaneMask, mut body: F) -> Result<u32, DispatchError>
    where
        F: FnMut(&mut BlockRuntime, &ConvergentTeam, &ConvergentLane) -> Result<(), DispatchError>,
    {
        let mut cursor = LaneCursor::default();
        let mut jobs = vec![ConvergentSimdJob::default(); warp.width as usize];
        let mut teams = 0;
        loop {
            let team = self.enter_convergent_simd(warp, mask, &mut cursor, &mut jobs)?;
            self.warp_fence(warp);
            for member in team.active() {
                body(self, &team, member)?;
            }
            for member in team.active() {
                self.exit_convergent_simd(member.hw_lane, &jobs[member.lane as usize])?;
            }
            teams += 1;
            if team.is_final {
                return Ok(teams);
            }
        }
    }

    /// Drive a convergent parallel construct over `mask` to completion.
    pub fn convergent_parallel_loop<F>(
        &mut self,
        warp: Warp,
        mask: LaneMask,
        mut body: F,
    ) -> Result<u32, DispatchError>
    where
        F: FnMut(&mut BlockRuntime, &ConvergentTeam, &ConvergentLane) -> Result<(), DispatchError>,
    {
        let mut cursor = LaneCursor::default();
        let mut jobs = vec![ConvergentParallelJob::default(); warp.width as usize];
        let mut teams = 0;
        loop {
            let team = self.enter_convergent_parallel(warp, mask, &mut cursor, &mut jobs)?;
            self.warp_fence(warp);
            for member in team.active() {
                body(self, &team, member)?;
            }
            for member in team.active() {
                self.exit_convergent_parallel(member.hw_lane, &jobs[member.lane as usize])?;
            }
            teams += 1;
            if team.is_final {
                return Ok(teams);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchConfig;
    use crate::context::ParallelDepth;
    use crate::kernel::{Dim3, ExecMode, LaunchConfig};
    use crate::parallel::Ident;
    use crate::warp::WARP_SIZE;

    const LOC: Ident = Ident::UNKNOWN;

    fn spmd(block: u32) -> BlockRuntime {
        let cfg = LaunchConfig::new(Dim3::x(1), Dim3::x(block));
        BlockRuntime::new(ArchConfig::volta(), ExecMode::Spmd, &cfg)
    }

    #[test]
    fn first_sub_team_of_0b1011_with_width_one() {
        let mut rt = spmd(64);
        let warp = Warp::new(0, WARP_SIZE);
        rt.push_simd_limit(&LOC, 0, 1).unwrap();

        let mut cursor = LaneCursor::default();
        let mut jobs = vec![ConvergentSimdJob::default(); WARP_SIZE as usize];
        let team = rt
            .enter_convergent_simd(warp, LaneMask(0b1011), &mut cursor, &mut jobs)
            .unwrap();
        assert_eq!(team.lane_source, 0);
        assert_eq!(team.num_lanes, 1);
        assert!(!team.is_final);
        assert_eq!(team.active_mask(), LaneMask(0b1));
        assert_eq!(cursor, LaneCursor(1));
        // the source consumed its hint
        assert_eq!(rt.pending_simd_limit(0).unwrap(), 0);

        rt.exit_convergent_simd(0, &jobs[0]).unwrap();
        // exit restores the value held on entry
        assert_eq!(rt.pending_simd_limit(0).unwrap(), 1);

        let team = rt
            .enter_convergent_simd(warp, LaneMask(0b1011), &mut cursor, &mut jobs)
            .unwrap();
        assert_eq!(team.lane_source, 1);
        assert_eq!(team.num_lanes, 3);
        assert_eq!(team.active_mask(), LaneMask(0b1011));
        for member in team.active() {
            rt.exit_convergent_simd(member.hw_lane, &jobs[member.lane as usize]).unwrap();
        }

        let team = rt
            .enter_convergent_simd(warp, LaneMask(0b1011), &mut cursor, &mut jobs)
            .unwrap();
        assert_eq!(team.lane_source, 3);
        assert!(team.is_final);

        assert!(matches!(
            rt.enter_convergent_simd(warp, LaneMask(0b1011), &mut cursor, &mut jobs),
            Err(DispatchError::NoRemainingLanes { cursor: 4, .. })
        ));
    }

    #[test]
    fn short_job_buffer_leaves_lanes_untouched() {
        let mut rt = spmd(64);
        let warp = Warp::new(0, WARP_SIZE);
        rt.push_simd_limit(&LOC, 0, 2).unwrap();
        rt.push_num_threads(&LOC, 0, 2).unwrap();
        let before: Vec<_> = (0..4).map(|l| rt.state.top(l).unwrap()).collect();

        let mut cursor = LaneCursor::default();
        let mut simd_jobs = vec![ConvergentSimdJob::default(); 2];
        assert!(matches!(
            rt.enter_convergent_simd(warp, LaneMask(0b1111), &mut cursor, &mut simd_jobs),
            Err(DispatchError::LaneOutOfRange { lane: 2, limit: 32 })
        ));
        let mut parallel_jobs = vec![ConvergentParallelJob::default(); 3];
        assert!(rt
            .enter_convergent_parallel(warp, LaneMask(0b1111), &mut cursor, &mut parallel_jobs)
            .is_err());

        assert_eq!(cursor, LaneCursor(0));
        assert_eq!(rt.pending_simd_limit(0).unwrap(), 2);
        assert_eq!(rt.pending_num_threads(0).unwrap(), 2);
        let after: Vec<_> = (0..4).map(|l| rt.state.top(l).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn convergent_parallel_from_sequential_code_is_level_one() {
        // the generic master is lane 0 of warp 1
        let cfg = LaunchConfig::new(Dim3::x(1), Dim3::x(64));
        let mut rt = BlockRuntime::new(ArchConfig::volta(), ExecMode::Generic, &cfg);
        let warp = Warp::containing(rt.master_lane(), WARP_SIZE);
        let master = rt.master_lane();
        assert_eq!(rt.parallel_level(&LOC, master).unwrap(), 0);

        let mut cursor = LaneCursor::default();
        let mut jobs = vec![ConvergentParallelJob::default(); WARP_SIZE as usize];
        let team = rt
            .enter_convergent_parallel(warp, LaneMask(0b1), &mut cursor, &mut jobs)
            .unwrap();
        assert!(team.is_final);
        assert_eq!(rt.parallel_level(&LOC, master).unwrap(), 1);
        assert_eq!(rt.current_context(master).unwrap().depth, ParallelDepth::Level1);

        rt.exit_convergent_parallel(master, &jobs[0]).unwrap();
        assert_eq!(rt.parallel_level(&LOC, master).unwrap(), 0);
    }

    #[test]
    fn simd_lanes_borrow_the_source_context() {
        let mut rt = spmd(64);
        let warp = Warp::new(1, WARP_SIZE);
        let mask = LaneMask::from_lanes([2, 4, 9]);
        let mut cursor = LaneCursor(3);
        let mut jobs = vec![ConvergentSimdJob::default(); WARP_SIZE as usize];

        let team = rt.enter_convergent_simd(warp, mask, &mut cursor, &mut jobs).unwrap();
        assert_eq!(team.lane_source, 4);
        for member in team.active() {
            // identity stays with the source's context
            assert_eq!(rt.omp_thread_num(member.hw_lane).unwrap(), 36);
        }
        for member in team.active() {
            rt.exit_convergent_simd(member.hw_lane, &jobs[member.lane as usize]).unwrap();
        }
        assert_eq!(rt.omp_thread_num(34).unwrap(), 34);
        assert_eq!(rt.omp_thread_num(41).unwrap(), 41);
    }

    #[test]
    fn parallel_lanes_are_renumbered_by_rank() {
        let mut rt = spmd(32);
        let warp = Warp::new(0, WARP_SIZE);
        let mask = LaneMask::from_lanes([1, 5, 6, 20]);
        rt.push_num_threads(&LOC, 1, 3).unwrap();
        let live = rt.live_contexts();

        let mut cursor = LaneCursor::default();
        let mut jobs = vec![ConvergentParallelJob::default(); WARP_SIZE as usize];
        let team = rt.enter_convergent_parallel(warp, mask, &mut cursor, &mut jobs).unwrap();
        assert_eq!(team.lane_source, 1);
        assert_eq!(team.num_lanes, 3);
        assert_eq!(team.active_mask(), LaneMask::from_lanes([1, 5, 6]));
        rt.warp_fence(warp);

        for (rank, lane) in [1u32, 5, 6].into_iter().enumerate() {
            let ctx = rt.current_context(lane).unwrap();
            assert_eq!(ctx.thread_id, rank as u32);
            assert_eq!(ctx.threads_in_team, 3);
            assert_eq!(ctx.depth, ParallelDepth::Nested);
        }
        assert_eq!(rt.parallel_level(&LOC, 20).unwrap(), 1);
        assert_eq!(rt.live_contexts(), live + 3);

        for member in team.active() {
            rt.exit_convergent_parallel(member.hw_lane, &jobs[member.lane as usize]).unwrap();
        }
        assert_eq!(rt.live_contexts(), live);
        assert_eq!(rt.parallel_level(&LOC, 5).unwrap(), 1);
        assert_eq!(rt.omp_thread_num(5).unwrap(), 5);
    }

    #[test]
    fn loop_visits_every_lane_once() {
        let mut rt = spmd(64);
        let warp = Warp::new(1, WARP_SIZE);
        let mask = LaneMask::from_lanes([0, 3, 4, 17, 31]);
        let mut sources = Vec::new();
        let teams = rt
            .convergent_parallel_loop(warp, mask, |_, team, member| {
                if member.lane_id == 0 {
                    sources.push(team.lane_source);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(teams, 5);
        assert_eq!(sources, vec![0, 3, 4, 17, 31]);
        assert_eq!(rt.counters().fences, 5);
    }

    #[test]
    fn uninitialized_runtime_has_no_convergent_dispatch() {
        let cfg = LaunchConfig::new(Dim3::x(1), Dim3::x(32)).uninitialized();
        let mut rt = BlockRuntime::new(ArchConfig::volta(), ExecMode::Spmd, &cfg);
        let mut jobs = vec![ConvergentSimdJob::default(); WARP_SIZE as usize];
        assert!(matches!(
            rt.enter_convergent_simd(
                Warp::new(0, WARP_SIZE),
                LaneMask(0b11),
                &mut LaneCursor::default(),
                &mut jobs
            ),
            Err(DispatchError::RuntimeUninitialized)
        ));
    }
}
