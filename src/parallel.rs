/// Parallel-region dispatch for one block.
///
/// `BlockRuntime` is the per-launch state of a single block together with
/// every entry point compiler-generated code calls around a parallel
/// construct:
///   - master:  `prepare_parallel` sizes the team and publishes the region
///   - workers: `enter_parallel` / `exit_parallel` join and leave it
///   - nested:  `begin_serialized_parallel` / `end_serialized_parallel`
///   - hints:   `push_num_threads`, `push_simd_limit`, `push_num_teams`, `push_proc_bind`
///   - queries: `parallel_level`, `global_thread_num`, `omp_thread_num`, ...
///
/// All lane arguments are hardware lane indices within the block; the
/// logical thread id is recomputed from them on every call.
use tracing::{debug, error, trace};

use crate::arch::{determine_team_size, ArchConfig, SizingRequest, TeamSizeLimiter};
use crate::context::{LoopState, TaskContext};
use crate::error::DispatchError;
use crate::kernel::{BlockShape, ExecMode, LaunchConfig};
use crate::state::PerBlockState;
use crate::work::{WorkDescriptor, WorkFn};

/// Source location of the construct making a runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ident {
    pub psource: &'static str,
}

impl Ident {
    pub const UNKNOWN: Ident = Ident { psource: ";unknown;unknown;0;0;;" };

    pub fn new(psource: &'static str) -> Self {
        Ident { psource }
    }
}

/// Outcome of a worker's `enter_parallel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The master published the null work function: the team shuts down.
    Terminate,
    /// A region is running but this worker is not part of its team.
    Idle(WorkFn),
    /// This worker executes the region body.
    Active(WorkFn),
}

impl Activation {
    pub fn is_active(&self) -> bool {
        matches!(self, Activation::Active(_))
    }

    pub fn work_fn(&self) -> Option<WorkFn> {
        match *self {
            Activation::Terminate => None,
            Activation::Idle(f) | Activation::Active(f) => Some(f),
        }
    }
}

/// Result of the master's sizing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamDecision {
    pub team_size: u32,
    pub limiter: TeamSizeLimiter,
}

/// Running totals of dispatch events in this block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    pub regions: u32,
    pub activations: u32,
    pub serialized: u32,
    pub convergent_teams: u32,
    pub fences: u32,
}

/// Per-launch dispatch state of one block.
pub struct BlockRuntime {
    pub(crate) arch: ArchConfig,
    pub(crate) shape: BlockShape,
    initialized: bool,
    pub(crate) state: PerBlockState,
    pub(crate) work: WorkDescriptor,
    pub(crate) counters: DispatchCounters,
}

impl BlockRuntime {
    /// Kernel entry for one block: builds the outermost context(s).
    ///
    /// Generic mode creates one initial context that every thread's stack
    /// starts from. SPMD mode additionally gives every lane a level-1 context
    /// for a team spanning the block. An uninitialized runtime (SPMD only)
    /// keeps nothing but a nesting counter per thread.
    pub fn new(arch: ArchConfig, mode: ExecMode, config: &LaunchConfig) -> Self {
        let block_size = config.threads_per_block();
        let shape = BlockShape::new(block_size, arch.simd_width, mode);
        let threads = block_size as usize;
        let initialized = config.runtime_initialized || mode == ExecMode::Generic;

        let state = if !initialized {
            PerBlockState::simple(threads)
        } else {
            let initial = TaskContext::initial(config.thread_limit);
            let mut state = PerBlockState::with_stacks(threads, initial.clone());
            if mode == ExecMode::Spmd {
                for tid in 0..block_size {
                    if let (Ok(root), Some(slot)) = (state.top(tid), state.level1(tid)) {
                        let ctx = TaskContext::spmd_level_one(tid, block_size, root, &initial);
                        if state.arena.overwrite(slot, ctx) {
                            state.set_top(tid, slot);
                        }
                    }
                }
            }
            state
        };

        debug!(
            target: "simtomp::parallel",
            arch = %arch.name,
            %mode,
            block_size,
            initialized,
            thread_limit = config.thread_limit,
            "block runtime initialized"
        );

        BlockRuntime {
            arch,
            shape,
            initialized,
            state,
            work: WorkDescriptor::default(),
            counters: DispatchCounters::default(),
        }
    }

    pub fn arch(&self) -> &ArchConfig {
        &self.arch
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn counters(&self) -> DispatchCounters {
        self.counters
    }

    pub fn master_lane(&self) -> u32 {
        self.shape.master_lane()
    }

    /// Lanes the launch provides to a parallel region.
    pub fn available_lanes(&self) -> u32 {
        self.shape.available_lanes()
    }

    /// Live task-context records (initial and level-1 slots included).
    pub fn live_contexts(&self) -> usize {
        self.state.arena.live()
    }

    pub(crate) fn logical_tid(&self, lane: u32) -> Result<u32, DispatchError> {
        if lane >= self.shape.block_size {
            return Err(DispatchError::LaneOutOfRange {
                lane,
                limit: self.shape.block_size,
            });
        }
        Ok(self.shape.logical_thread_id(lane))
    }

    fn require_initialized(&self, runtime_initialized: bool) -> Result<(), DispatchError> {
        if !runtime_initialized || !self.initialized {
            error!(target: "simtomp::parallel", "expected an initialized runtime");
            return Err(DispatchError::RuntimeUninitialized);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Level-1 parallel regions (generic mode)
    // -----------------------------------------------------------------------

    /// Master-only: decide the team size of the next region and publish it
    /// together with `work_fn` in the work descriptor.
    pub fn prepare_parallel(
        &mut self,
        lane: u32,
        work_fn: WorkFn,
        runtime_initialized: bool,
    ) -> Result<TeamDecision, DispatchError> {
        self.require_initialized(runtime_initialized)?;
        if self.shape.mode != ExecMode::Generic || lane != self.master_lane() {
            error!(target: "simtomp::parallel", lane, "only the team master can create a parallel region");
            return Err(DispatchError::NotMaster { lane });
        }

        // The master shadows logical thread 0.
        let tid = 0;
        let top_id = self.state.top(tid)?;
        let current = self.state.context(top_id)?;
        if current.depth.in_parallel() {
            error!(target: "simtomp::parallel", "cannot be called in a parallel region");
            return Err(DispatchError::AlreadyInParallel);
        }
        let request = SizingRequest {
            num_threads_clause: self.state.pending_num_threads(tid),
            nthreads_icv: current.nthreads_icv,
            thread_limit: current.thread_limit,
            available_lanes: self.available_lanes(),
        };
        let template_base = current.clone();
        // Reset the request so it does not leak into the next region.
        self.state.take_pending_num_threads(tid);

        let (team_size, limiter) = determine_team_size(&request, &self.arch);
        if team_size == 0 {
            error!(target: "simtomp::parallel", team_size, "bad thread request");
            return Err(DispatchError::InvalidTeamSize { team_size });
        }

        self.work
            .publish(work_fn, template_base.team_template(top_id, team_size));
        self.counters.regions += 1;

        debug!(
            target: "simtomp::parallel",
            work_fn = work_fn.id(),
            team_size,
            %limiter,
            clause = request.num_threads_clause,
            thread_limit = request.thread_limit,
            available = request.available_lanes,
            "prepared parallel region"
        );
        Ok(TeamDecision { team_size, limiter })
    }

    /// Every worker, after the barrier following `prepare_parallel`.
    pub fn enter_parallel(
        &mut self,
        lane: u32,
        runtime_initialized: bool,
    ) -> Result<Activation, DispatchError> {
        self.require_initialized(runtime_initialized)?;
        let Some(work_fn) = self.work.work_fn() else {
            trace!(target: "simtomp::parallel", lane, "termination signal");
            return Ok(Activation::Terminate);
        };
        if self.shape.mode != ExecMode::Generic || lane >= self.master_lane() {
            return Err(DispatchError::NotWorker { lane });
        }

        // Workers are never in the master warp, so the hardware id is the
        // logical id and also the rank in the new team.
        let tid = lane;
        if tid >= self.work.team_size() {
            trace!(target: "simtomp::parallel", lane, "not part of the team");
            return Ok(Activation::Idle(work_fn));
        }

        let slot = self
            .state
            .level1(tid)
            .ok_or(DispatchError::ContextUnderflow { thread: tid })?;
        let ctx = TaskContext {
            thread_id: tid % self.master_lane(),
            ..self.work.template().clone()
        };
        if !self.state.arena.overwrite(slot, ctx) {
            error!(target: "simtomp::parallel", lane, "level-1 context slot was released");
            return Err(DispatchError::ContextUnderflow { thread: tid });
        }
        self.state.set_top(tid, slot);
        if let Some(private) = self.state.private_event_mut(tid) {
            self.work.counters.init(private);
        }
        self.counters.activations += 1;

        trace!(target: "simtomp::parallel", lane, team = self.work.team_size(), "worker activated");
        Ok(Activation::Active(work_fn))
    }

    /// Active workers only, after the region body.
    pub fn exit_parallel(&mut self, lane: u32) -> Result<(), DispatchError> {
        let tid = self.logical_tid(lane)?;
        let top = self.state.top(tid)?;
        if Some(top) != self.state.level1(tid) {
            error!(target: "simtomp::parallel", lane, "unbalanced exit from parallel region");
            return Err(DispatchError::UnbalancedExit { thread: tid });
        }
        self.state.pop(tid)?;
        trace!(target: "simtomp::parallel", lane, "worker left region");
        Ok(())
    }

    /// Master-only: publish the null work function so that workers waiting in
    /// `enter_parallel` shut down.
    pub fn signal_termination(&mut self, lane: u32) -> Result<(), DispatchError> {
        if lane != self.master_lane() {
            return Err(DispatchError::NotMaster { lane });
        }
        self.work.terminate();
        debug!(target: "simtomp::parallel", "published termination signal");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Serialized regions
    // -----------------------------------------------------------------------

    /// Run a nested region with a team of one on the calling thread.
    pub fn begin_serialized_parallel(&mut self, loc: &Ident, lane: u32) -> Result<(), DispatchError> {
        let tid = self.logical_tid(lane)?;
        self.counters.serialized += 1;
        if !self.initialized {
            if let Some(level) = self.state.simple_level_mut(tid) {
                *level += 1;
            }
            trace!(target: "simtomp::parallel", lane, loc = loc.psource, "serialized (simple)");
            return Ok(());
        }

        let top_id = self.state.top(tid)?;
        let loop_state = self.state.loop_state(tid);
        let current = self.state.top_context_mut(tid)?;
        current.saved_loop = Some(loop_state);
        let child = current.serialized(top_id);
        let depth = child.depth;
        self.state.push(tid, child);

        trace!(target: "simtomp::parallel", lane, loc = loc.psource, level = depth.level(), "serialized parallel");
        Ok(())
    }

    pub fn end_serialized_parallel(&mut self, loc: &Ident, lane: u32) -> Result<(), DispatchError> {
        let tid = self.logical_tid(lane)?;
        if !self.initialized {
            match self.state.simple_level_mut(tid) {
                Some(level) if *level > 0 => *level -= 1,
                _ => {
                    error!(target: "simtomp::parallel", lane, loc = loc.psource, "end of a serialized region that was never entered");
                    return Err(DispatchError::UnbalancedExit { thread: tid });
                }
            }
            trace!(target: "simtomp::parallel", lane, loc = loc.psource, "end serialized (simple)");
            return Ok(());
        }

        if !self.top_is_serialized(tid)? {
            error!(target: "simtomp::parallel", lane, loc = loc.psource, "end of a serialized region that was never entered");
            return Err(DispatchError::UnbalancedExit { thread: tid });
        }
        let popped = self.state.pop(tid)?;
        self.state.arena.release(popped);

        let restored = self.state.top_context_mut(tid)?.saved_loop.take();
        if let (Some(saved), Some(slot)) = (restored, self.state.loop_state_mut(tid)) {
            *slot = saved;
        }
        trace!(target: "simtomp::parallel", lane, loc = loc.psource, "end serialized parallel");
        Ok(())
    }

    /// Whether the top of `tid`'s stack was pushed by `begin_serialized_parallel`:
    /// a single-thread team below a context that holds the saved loop state.
    /// Level-1 slots and the initial context never qualify.
    fn top_is_serialized(&self, tid: u32) -> Result<bool, DispatchError> {
        let top = self.state.top(tid)?;
        if Some(top) == self.state.level1(tid) {
            return Ok(false);
        }
        let ctx = self.state.context(top)?;
        let Some(parent) = ctx.parent else {
            return Ok(false);
        };
        let parent = self.state.context(parent)?;
        Ok(ctx.thread_id == 0
            && ctx.threads_in_team == 1
            && ctx.depth == parent.depth.deeper()
            && parent.saved_loop.is_some())
    }

    // -----------------------------------------------------------------------
    // Hints
    // -----------------------------------------------------------------------

    /// `num_threads` clause for the calling thread's next region.
    pub fn push_num_threads(&mut self, loc: &Ident, lane: u32, num_threads: u32) -> Result<(), DispatchError> {
        let tid = self.logical_tid(lane)?;
        self.state.set_pending_num_threads(tid, num_threads);
        trace!(target: "simtomp::parallel", lane, num_threads, loc = loc.psource, "push num_threads");
        Ok(())
    }

    /// `simdlen` request for the calling thread's next convergent simd region.
    pub fn push_simd_limit(&mut self, loc: &Ident, lane: u32, simd_limit: u32) -> Result<(), DispatchError> {
        let tid = self.logical_tid(lane)?;
        self.state.set_pending_simd_width(tid, simd_limit);
        trace!(target: "simtomp::parallel", lane, simd_limit, loc = loc.psource, "push simd limit");
        Ok(())
    }

    /// The grid is fixed at launch; requesting teams from a kernel is fatal.
    pub fn push_num_teams(
        &mut self,
        loc: &Ident,
        lane: u32,
        num_teams: u32,
        thread_limit: u32,
    ) -> Result<(), DispatchError> {
        error!(
            target: "simtomp::parallel",
            lane, num_teams, thread_limit, loc = loc.psource,
            "num_teams cannot be changed from inside a kernel"
        );
        Err(DispatchError::NumTeamsUnsupported)
    }

    /// Binding is implied by the lane mapping; accepted and ignored.
    pub fn push_proc_bind(&mut self, loc: &Ident, lane: u32, proc_bind: u32) -> Result<(), DispatchError> {
        trace!(target: "simtomp::parallel", lane, proc_bind, loc = loc.psource, "proc_bind ignored");
        Ok(())
    }

    /// `omp_set_num_threads`: sets the nthreads ICV of the current context.
    pub fn set_num_threads(&mut self, lane: u32, num_threads: u32) -> Result<(), DispatchError> {
        let tid = self.logical_tid(lane)?;
        if !self.initialized {
            return Ok(());
        }
        self.state.top_context_mut(tid)?.nthreads_icv = num_threads;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// 0 outside parallel regions, 1 directly inside one, 2 when nested deeper.
    pub fn parallel_level(&self, loc: &Ident, lane: u32) -> Result<u8, DispatchError> {
        let tid = self.logical_tid(lane)?;
        let level = if self.initialized {
            self.state.top_context(tid)?.depth.level()
        } else {
            self.state.simple_level(tid).min(2) as u8
        };
        trace!(target: "simtomp::parallel", lane, level, loc = loc.psource, "parallel level");
        Ok(level)
    }

    /// Logical thread id in the block, recomputed from the hardware lane.
    pub fn global_thread_num(&self, loc: &Ident, lane: u32) -> Result<u32, DispatchError> {
        let tid = self.logical_tid(lane)?;
        trace!(target: "simtomp::parallel", lane, tid, loc = loc.psource, "global thread num");
        Ok(tid)
    }

    /// `omp_get_thread_num`: rank in the current team.
    pub fn omp_thread_num(&self, lane: u32) -> Result<u32, DispatchError> {
        let tid = self.logical_tid(lane)?;
        if !self.initialized {
            return Ok(if self.state.simple_level(tid) > 0 { 0 } else { tid });
        }
        Ok(self.state.top_context(tid)?.thread_id)
    }

    /// `omp_get_num_threads`: size of the current team.
    pub fn omp_num_threads(&self, lane: u32) -> Result<u32, DispatchError> {
        let tid = self.logical_tid(lane)?;
        if !self.initialized {
            return Ok(if self.state.simple_level(tid) > 0 { 1 } else { self.shape.block_size });
        }
        Ok(self.state.top_context(tid)?.threads_in_team)
    }

    /// `omp_get_thread_limit`
    pub fn thread_limit(&self, lane: u32) -> Result<u32, DispatchError> {
        let tid = self.logical_tid(lane)?;
        if !self.initialized {
            return Ok(self.shape.block_size);
        }
        Ok(self.state.top_context(tid)?.thread_limit)
    }

    pub fn pending_num_threads(&self, lane: u32) -> Result<u32, DispatchError> {
        Ok(self.state.pending_num_threads(self.logical_tid(lane)?))
    }

    pub fn pending_simd_limit(&self, lane: u32) -> Result<u32, DispatchError> {
        Ok(self.state.pending_simd_width(self.logical_tid(lane)?))
    }

    /// Current top-of-stack context of the calling thread.
    pub fn current_context(&self, lane: u32) -> Result<&TaskContext, DispatchError> {
        let tid = self.logical_tid(lane)?;
        self.state.top_context(tid)
    }

    /// Work-sharing loop state of the calling thread.
    pub fn loop_state(&self, lane: u32) -> Result<LoopState, DispatchError> {
        Ok(self.state.loop_state(self.logical_tid(lane)?))
    }

    pub fn set_loop_state(&mut self, lane: u32, loop_state: LoopState) -> Result<(), DispatchError> {
        let tid = self.logical_tid(lane)?;
        if let Some(slot) = self.state.loop_state_mut(tid) {
            *slot = loop_state;
        }
        Ok(())
    }
}
