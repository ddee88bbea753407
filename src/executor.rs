/// Kernel execution engine.
/// Runs every block of the grid in turn. Within a block, the lanes are driven
/// in lockstep phases separated by block-wide barriers, mirroring the generic
/// mode state machine:
///   master: prepare_parallel → barrier → (workers run) → barrier → ...
///   worker: barrier → enter_parallel → body → exit_parallel → barrier → ...
/// and finally the master publishes the null work function so workers quit.
use tracing::{debug, info};

use crate::error::DispatchError;
use crate::gpu::GPU;
use crate::kernel::{Dim3, Kernel, KernelBody, LaunchConfig};
use crate::metrics::{now_ms, write_metrics, LiveMetrics};
use crate::parallel::{Activation, BlockRuntime, Ident};
use crate::sync::BlockBarrier;
use crate::context::LoopState;
use crate::work::WorkFn;

/// Statistics collected during a kernel launch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Total number of thread blocks executed
    pub blocks_executed: u32,
    /// Level-1 parallel regions dispatched by masters
    pub regions: u32,
    /// Worker activations across all regions
    pub activations: u32,
    /// Serialized (nested or uninitialized-mode) regions
    pub serialized_regions: u32,
    /// Convergent sub-teams formed
    pub convergent_teams: u32,
    /// Barrier phases per block (equal for every participating lane)
    pub barrier_phases: u64,
}

/// What one level-1 region looked like, for metrics.
#[derive(Debug, Clone, Default)]
pub struct RegionRecord {
    pub team_size: u32,
    pub limiter: String,
    pub active_lanes: Vec<u32>,
}

/// Context of the master lane while it runs the sequential part of a
/// generic-mode kernel.
pub struct MasterCtx<'a> {
    rt: &'a mut BlockRuntime,
    barrier: &'a mut BlockBarrier,
    runtime_initialized: bool,
    next_work_fn: u32,
    regions: &'a mut Vec<RegionRecord>,
}

impl<'a> MasterCtx<'a> {
    pub fn lane(&self) -> u32 {
        self.rt.master_lane()
    }

    pub fn runtime(&mut self) -> &mut BlockRuntime {
        &mut *self.rt
    }

    /// `num_threads` clause for the next region.
    pub fn push_num_threads(&mut self, num_threads: u32) -> Result<(), DispatchError> {
        let lane = self.lane();
        self.rt.push_num_threads(&Ident::UNKNOWN, lane, num_threads)
    }

    /// `omp_set_num_threads`
    pub fn set_num_threads(&mut self, num_threads: u32) -> Result<(), DispatchError> {
        let lane = self.lane();
        self.rt.set_num_threads(lane, num_threads)
    }

    pub fn level(&self) -> Result<u8, DispatchError> {
        self.rt.parallel_level(&Ident::UNKNOWN, self.lane())
    }

    /// View of the master lane as an ordinary thread, e.g. to run a
    /// serialized region from sequential code.
    pub fn as_thread(&mut self) -> RegionCtx<'_> {
        let lane = self.lane();
        RegionCtx { rt: &mut *self.rt, lane }
    }

    /// Run `body` as a level-1 parallel region on the worker lanes.
    /// Returns the team size.
    pub fn parallel<F>(&mut self, body: F) -> Result<u32, DispatchError>
    where
        F: Fn(&mut RegionCtx<'_>) -> Result<(), DispatchError>,
    {
        let master = self.lane();
        self.next_work_fn += 1;
        let work_fn = WorkFn::new(self.next_work_fn).ok_or(DispatchError::UnknownWorkFn)?;

        let decision = self.rt.prepare_parallel(master, work_fn, self.runtime_initialized)?;
        self.barrier.sync_all();

        let mut active = Vec::with_capacity(decision.team_size as usize);
        for lane in 0..master {
            match self.rt.enter_parallel(lane, self.runtime_initialized)? {
                Activation::Active(f) if f == work_fn => active.push(lane),
                Activation::Idle(f) if f == work_fn => {}
                _ => return Err(DispatchError::UnknownWorkFn),
            }
        }

        for &lane in &active {
            body(&mut RegionCtx { rt: &mut *self.rt, lane })?;
        }
        for &lane in &active {
            self.rt.exit_parallel(lane)?;
        }
        self.barrier.sync_all();

        debug!(
            target: "simtomp::executor",
            work_fn = work_fn.id(),
            team_size = decision.team_size,
            limiter = %decision.limiter,
            "region complete"
        );
        self.regions.push(RegionRecord {
            team_size: decision.team_size,
            limiter: decision.limiter.to_string(),
            active_lanes: active,
        });
        Ok(decision.team_size)
    }
}

/// Context of one lane executing a region body (or an SPMD kernel).
pub struct RegionCtx<'a> {
    rt: &'a mut BlockRuntime,
    lane: u32,
}

impl<'a> RegionCtx<'a> {
    pub fn new(rt: &'a mut BlockRuntime, lane: u32) -> Self {
        RegionCtx { rt, lane }
    }

    /// Hardware lane within the block
    pub fn lane(&self) -> u32 {
        self.lane
    }

    pub fn runtime(&mut self) -> &mut BlockRuntime {
        &mut *self.rt
    }

    /// `omp_get_thread_num`
    pub fn thread_num(&self) -> Result<u32, DispatchError> {
        self.rt.omp_thread_num(self.lane)
    }

    /// `omp_get_num_threads`
    pub fn num_threads(&self) -> Result<u32, DispatchError> {
        self.rt.omp_num_threads(self.lane)
    }

    /// `omp_get_level` as seen by the parallel-level query
    pub fn level(&self) -> Result<u8, DispatchError> {
        self.rt.parallel_level(&Ident::UNKNOWN, self.lane)
    }

    pub fn thread_limit(&self) -> Result<u32, DispatchError> {
        self.rt.thread_limit(self.lane)
    }

    pub fn push_num_threads(&mut self, num_threads: u32) -> Result<(), DispatchError> {
        self.rt.push_num_threads(&Ident::UNKNOWN, self.lane, num_threads)
    }

    pub fn loop_state(&self) -> Result<LoopState, DispatchError> {
        self.rt.loop_state(self.lane)
    }

    pub fn set_loop_state(&mut self, loop_state: LoopState) -> Result<(), DispatchError> {
        self.rt.set_loop_state(self.lane, loop_state)
    }

    /// A parallel construct reached from inside a region: nested regions
    /// beyond the first level run serialized on the calling thread.
    pub fn parallel<F>(&mut self, body: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut RegionCtx<'_>) -> Result<(), DispatchError>,
    {
        let loc = Ident::new(";nested;parallel;0;0;;");
        // A serialized region has a team of one; any pending clause is spent.
        let tid = self.rt.logical_tid(self.lane)?;
        self.rt.state.take_pending_num_threads(tid);
        self.rt.begin_serialized_parallel(&loc, self.lane)?;
        let result = body(&mut RegionCtx { rt: &mut *self.rt, lane: self.lane });
        self.rt.end_serialized_parallel(&loc, self.lane)?;
        result
    }
}

/// Executes a kernel on a GPU, one block at a time.
pub struct KernelExecutor<'a> {
    pub gpu: &'a mut GPU,
}

impl<'a> KernelExecutor<'a> {
    pub fn new(gpu: &'a mut GPU) -> Self {
        KernelExecutor { gpu }
    }

    /// Launch a kernel with the given configuration. Any fatal dispatch
    /// error aborts the launch.
    pub fn launch(&mut self, kernel: &Kernel, config: &LaunchConfig) -> Result<ExecutionStats, DispatchError> {
        let mut stats = ExecutionStats::default();

        info!(
            target: "simtomp::executor",
            kernel = %kernel.name,
            mode = %kernel.mode(),
            arch = %self.gpu.arch.name,
            grid = ?(config.grid_dim.x, config.grid_dim.y, config.grid_dim.z),
            block = ?(config.block_dim.x, config.block_dim.y, config.block_dim.z),
            "launching kernel"
        );

        for bz in 0..config.grid_dim.z {
            for by in 0..config.grid_dim.y {
                for bx in 0..config.grid_dim.x {
                    let block_idx = Dim3::new(bx, by, bz);
                    let outcome = self.execute_block(kernel, config, block_idx)?;

                    let counters = outcome.rt.counters();
                    stats.blocks_executed += 1;
                    stats.regions += counters.regions;
                    stats.activations += counters.activations;
                    stats.serialized_regions += counters.serialized;
                    stats.convergent_teams += counters.convergent_teams;
                    stats.barrier_phases = outcome.barrier_phases;

                    if self.gpu.live_metrics {
                        self.publish_metrics(kernel, config, &stats, &outcome);
                    }
                }
            }
        }

        info!(
            target: "simtomp::executor",
            kernel = %kernel.name,
            blocks = stats.blocks_executed,
            regions = stats.regions,
            activations = stats.activations,
            "kernel complete"
        );
        Ok(stats)
    }

    /// Run one block to completion.
    fn execute_block(
        &mut self,
        kernel: &Kernel,
        config: &LaunchConfig,
        block_idx: Dim3,
    ) -> Result<BlockOutcome, DispatchError> {
        let block_size = config.threads_per_block();
        let mut rt = BlockRuntime::new(self.gpu.arch.clone(), kernel.mode(), config);
        let mut regions = Vec::new();

        let barrier = match &kernel.body {
            KernelBody::Generic(func) => {
                let master = rt.master_lane();
                // The rest of the master warp idles for the whole kernel.
                let mut barrier = BlockBarrier::new(block_size, (0..master).chain([master]));
                {
                    let mut ctx = MasterCtx {
                        rt: &mut rt,
                        barrier: &mut barrier,
                        runtime_initialized: config.runtime_initialized,
                        next_work_fn: 0,
                        regions: &mut regions,
                    };
                    func(&mut ctx)?;
                }

                rt.signal_termination(master)?;
                barrier.sync_all();
                for lane in 0..master {
                    if rt.enter_parallel(lane, config.runtime_initialized)? != Activation::Terminate {
                        return Err(DispatchError::UnknownWorkFn);
                    }
                }
                barrier
            }
            KernelBody::Spmd(func) => {
                let mut barrier = BlockBarrier::new(block_size, 0..block_size);
                for lane in 0..block_size {
                    func(&mut RegionCtx::new(&mut rt, lane))?;
                }
                barrier.sync_all();
                barrier
            }
        };

        let barrier_phases = barrier.check_aligned()?;
        debug!(
            target: "simtomp::executor",
            block = ?(block_idx.x, block_idx.y, block_idx.z),
            barrier_phases,
            "block complete"
        );
        Ok(BlockOutcome { rt, barrier, regions, barrier_phases })
    }

    fn publish_metrics(
        &self,
        kernel: &Kernel,
        config: &LaunchConfig,
        stats: &ExecutionStats,
        outcome: &BlockOutcome,
    ) {
        let block_size = config.threads_per_block();
        let last = outcome.regions.last();
        let mut lane_active = vec![false; block_size as usize];
        if let Some(region) = last {
            for &lane in &region.active_lanes {
                if let Some(slot) = lane_active.get_mut(lane as usize) {
                    *slot = true;
                }
            }
        }

        let blocks_total = config.num_blocks();
        write_metrics(&LiveMetrics {
            status: if stats.blocks_executed == blocks_total {
                "complete".to_string()
            } else {
                "running".to_string()
            },
            kernel_name: kernel.name.clone(),
            arch: self.gpu.arch.name.clone(),
            mode: kernel.mode().to_string(),
            grid: [config.grid_dim.x, config.grid_dim.y, config.grid_dim.z],
            block: [config.block_dim.x, config.block_dim.y, config.block_dim.z],
            blocks_total,
            blocks_executed: stats.blocks_executed,
            simd_width: self.gpu.arch.simd_width,
            available_lanes: outcome.rt.available_lanes(),
            regions: stats.regions,
            activations: stats.activations,
            serialized_regions: stats.serialized_regions,
            convergent_teams: stats.convergent_teams,
            last_team_size: last.map(|r| r.team_size).unwrap_or(0),
            last_limiter: last.map(|r| r.limiter.clone()).unwrap_or_default(),
            lane_active,
            barrier_arrivals: outcome.barrier.counts(),
            timestamp_ms: now_ms(),
        });
    }
}

struct BlockOutcome {
    rt: BlockRuntime,
    barrier: BlockBarrier,
    regions: Vec<RegionRecord>,
    barrier_phases: u64,
}
