use crate::arch::{determine_team_size, ArchConfig, SizingRequest};
use crate::gpu::GPU;
use crate::kernel::{Dim3, ExecMode, Kernel, LaunchConfig};
use crate::parallel::{Activation, BlockRuntime, Ident};
use crate::warp::{LaneMask, Warp};
use crate::work::WorkFn;
use proptest::prelude::*;

fn arch_strategy() -> impl Strategy<Value = ArchConfig> {
    prop_oneof![
        Just(ArchConfig::volta()),
        Just(ArchConfig::pascal()),
        Just(ArchConfig::wave64()),
    ]
}

fn generic_block(block_size: u32) -> BlockRuntime {
    let config = LaunchConfig::new(Dim3::x(1), Dim3::x(block_size));
    BlockRuntime::new(ArchConfig::volta(), ExecMode::Generic, &config)
}

proptest! {
    /// Property: the team never exceeds what the launch, the thread limit or
    /// the clause allow, and full-group architectures only produce whole groups.
    #[test]
    fn prop_team_size_respects_every_bound(
        arch in arch_strategy(),
        available in 1..1024u32,
        thread_limit in 0..1024u32,
        clause in 0..1024u32,
    ) {
        let req = SizingRequest {
            num_threads_clause: clause,
            nthreads_icv: 0,
            thread_limit,
            available_lanes: available,
        };
        let (n, _) = determine_team_size(&req, &arch);

        prop_assert!(n >= 1);
        prop_assert!(n <= available);
        if thread_limit != 0 {
            prop_assert!(n <= thread_limit.max(1));
        }
        if clause != 0 {
            prop_assert!(n <= clause);
        }
        if arch.full_group_activation {
            prop_assert!(
                n == available || n == 1 || n % arch.simd_width == 0,
                "team of {} on {} with {} available", n, arch.name, available
            );
        }
    }

    /// Property: a clause is consumed by the region it sized.
    #[test]
    fn prop_num_threads_hint_is_single_use(block_size in 64..512u32, clause in 1..512u32) {
        let mut rt = generic_block(block_size);
        let master = rt.master_lane();

        let baseline = rt.prepare_parallel(master, WorkFn::new(1).unwrap(), true).unwrap();
        rt.push_num_threads(&Ident::UNKNOWN, master, clause).unwrap();
        rt.prepare_parallel(master, WorkFn::new(2).unwrap(), true).unwrap();
        let after = rt.prepare_parallel(master, WorkFn::new(3).unwrap(), true).unwrap();

        prop_assert_eq!(after, baseline);
        prop_assert_eq!(rt.pending_num_threads(master).unwrap(), 0);
    }

    /// Property: active workers are exactly the lowest ranks of the block.
    #[test]
    fn prop_activation_is_monotonic_in_rank(block_size in 33..512u32, clause in 0..512u32) {
        let mut rt = generic_block(block_size);
        let master = rt.master_lane();
        rt.push_num_threads(&Ident::UNKNOWN, master, clause).unwrap();
        let work_fn = WorkFn::new(7).unwrap();
        let decision = rt.prepare_parallel(master, work_fn, true).unwrap();

        let mut active = Vec::new();
        for lane in 0..master {
            match rt.enter_parallel(lane, true).unwrap() {
                Activation::Active(f) => {
                    prop_assert_eq!(f, work_fn);
                    prop_assert_eq!(rt.omp_thread_num(lane).unwrap(), lane);
                    active.push(lane);
                }
                Activation::Idle(f) => prop_assert_eq!(f, work_fn),
                Activation::Terminate => prop_assert!(false, "unexpected termination"),
            }
        }
        prop_assert_eq!(active, (0..decision.team_size).collect::<Vec<_>>());
    }

    /// Property: a worker that enters and exits a region is back on the
    /// context it had before, whatever the team size.
    #[test]
    fn prop_worker_exit_restores_stack(block_size in 33..512u32, clause in 0..512u32, rounds in 1..4u32) {
        let mut rt = generic_block(block_size);
        let master = rt.master_lane();
        let tops: Vec<_> = (0..master).map(|lane| rt.state.top(lane).unwrap()).collect();
        let live = rt.live_contexts();

        for round in 1..=rounds {
            rt.push_num_threads(&Ident::UNKNOWN, master, clause).unwrap();
            rt.prepare_parallel(master, WorkFn::new(round).unwrap(), true).unwrap();
            let active: Vec<u32> = (0..master)
                .filter(|&lane| rt.enter_parallel(lane, true).unwrap().is_active())
                .collect();
            for &lane in &active {
                prop_assert_eq!(rt.parallel_level(&Ident::UNKNOWN, lane).unwrap(), 1);
                rt.exit_parallel(lane).unwrap();
            }

            let after: Vec<_> = (0..master).map(|lane| rt.state.top(lane).unwrap()).collect();
            prop_assert_eq!(&after, &tops);
            prop_assert_eq!(rt.live_contexts(), live);
            for lane in 0..master {
                prop_assert_eq!(rt.parallel_level(&Ident::UNKNOWN, lane).unwrap(), 0);
            }
        }
    }

    /// Property: balanced serialized regions leave no context behind.
    #[test]
    fn prop_serialized_nesting_balances(depth in 1..12usize, lane in 0..96u32) {
        let mut rt = generic_block(128);
        let live = rt.live_contexts();
        for level in 0..depth {
            rt.begin_serialized_parallel(&Ident::UNKNOWN, lane).unwrap();
            prop_assert_eq!(rt.parallel_level(&Ident::UNKNOWN, lane).unwrap(), (level + 1).min(2) as u8);
            prop_assert_eq!(rt.omp_num_threads(lane).unwrap(), 1);
        }
        for _ in 0..depth {
            rt.end_serialized_parallel(&Ident::UNKNOWN, lane).unwrap();
        }
        prop_assert_eq!(rt.live_contexts(), live);
        prop_assert_eq!(rt.parallel_level(&Ident::UNKNOWN, lane).unwrap(), 0);
    }

    /// Property: without a runtime the reported level saturates at 2.
    #[test]
    fn prop_uninitialized_level_saturates(depth in 0..8u32) {
        let config = LaunchConfig::new(Dim3::x(1), Dim3::x(64)).uninitialized();
        let mut rt = BlockRuntime::new(ArchConfig::volta(), ExecMode::Spmd, &config);
        for _ in 0..depth {
            rt.begin_serialized_parallel(&Ident::UNKNOWN, 5).unwrap();
        }
        prop_assert_eq!(rt.parallel_level(&Ident::UNKNOWN, 5).unwrap() as u32, depth.min(2));
    }

    /// Property: repeating convergent simd until `is_final` uses every lane
    /// of the mask once as a source, and every sub-team is a rank prefix.
    #[test]
    fn prop_convergent_loop_partitions_the_mask(
        bits in 1..u32::MAX,
        hints in proptest::collection::vec(0..8u32, 32),
    ) {
        let config = LaunchConfig::new(Dim3::x(1), Dim3::x(64));
        let mut rt = BlockRuntime::new(ArchConfig::volta(), ExecMode::Spmd, &config);
        let warp = Warp::new(1, 32);
        let mask = LaneMask(bits as u64);
        for lane in mask.lanes() {
            rt.push_simd_limit(&Ident::UNKNOWN, warp.hw_lane(lane), hints[lane as usize]).unwrap();
        }

        let mut sources = Vec::new();
        let teams = rt.convergent_simd_loop(warp, mask, |_, team, member| {
            if member.lane_id == 0 {
                sources.push(team.lane_source);
            }
            assert!(member.lane_id < team.num_lanes);
            assert_eq!(team.active_mask().count(), team.num_lanes);
            Ok(())
        }).unwrap();

        prop_assert_eq!(teams, mask.count());
        prop_assert_eq!(sources, mask.lanes().collect::<Vec<_>>());
        // every lane is back on its own level-1 context
        for lane in mask.lanes() {
            prop_assert_eq!(rt.omp_thread_num(warp.hw_lane(lane)).unwrap(), warp.hw_lane(lane));
        }
    }

    /// Property: every participant of a generic block arrives at the same
    /// number of barriers, whatever the team sizes.
    #[test]
    fn prop_barriers_stay_aligned(
        block_size in 33..320u32,
        clauses in proptest::collection::vec(0..320u32, 1..5),
    ) {
        let mut gpu = GPU::pascal();
        let regions = clauses.len() as u64;
        let kernel = Kernel::new("aligned", move |m| {
            for &clause in &clauses {
                m.push_num_threads(clause)?;
                m.parallel(|_| Ok(()))?;
            }
            Ok(())
        });
        let stats = gpu
            .launch_kernel(&kernel, &LaunchConfig::new(Dim3::x(1), Dim3::x(block_size)))
            .unwrap();
        prop_assert_eq!(stats.barrier_phases, 2 * regions + 1);
    }
}
