use simtomp::arch::ArchConfig;
use simtomp::gpu::GPU;
use simtomp::kernel::{Dim3, ExecMode, Kernel, LaunchConfig};
use simtomp::parallel::{BlockRuntime, Ident};
use simtomp::warp::{LaneMask, Warp};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Optional launch configuration as JSON, e.g.
    //   {"grid_dim":{"x":4,"y":1,"z":1},"block_dim":{"x":160,"y":1,"z":1},"thread_limit":0}
    let config = match std::env::args().nth(1) {
        Some(path) => LaunchConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => LaunchConfig::new(Dim3::x(2), Dim3::x(128)),
    };

    let mut gpu = GPU::volta().with_live_metrics();
    info!(
        arch = %gpu.arch.name,
        simd_width = gpu.arch.simd_width,
        blocks = config.num_blocks(),
        threads_per_block = config.threads_per_block(),
        "initialized device"
    );

    // --- Generic-mode target region ---
    // The master runs the sequential code and forks two parallel regions;
    // the second one nests a region that runs serialized on each worker.
    let kernel = Kernel::new("nested_regions", |m| {
        m.push_num_threads(33)?;
        let first = m.parallel(|t| {
            if t.thread_num()? == 0 {
                info!(num_threads = t.num_threads()?, level = t.level()?, "first region");
            }
            Ok(())
        })?;

        m.set_num_threads(48)?;
        let second = m.parallel(|t| {
            t.push_num_threads(4)?;
            t.parallel(|inner| {
                if inner.lane() == 0 {
                    info!(
                        num_threads = inner.num_threads()?,
                        level = inner.level()?,
                        "nested region runs serialized"
                    );
                }
                Ok(())
            })
        })?;
        info!(first, second, "master finished");
        Ok(())
    });

    let stats = gpu.launch_kernel(&kernel, &config)?;
    println!(
        "Stats: {} blocks | {} regions | {} activations | {} serialized | {} barrier phases/block",
        stats.blocks_executed,
        stats.regions,
        stats.activations,
        stats.serialized_regions,
        stats.barrier_phases,
    );

    // --- Convergent simd inside divergent code ---
    // Lanes 0, 1 and 3 of warp 0 reach a simd construct; lane 0 asked for a
    // single lane, lane 1 for all of them.
    let spmd = LaunchConfig::new(Dim3::x(1), Dim3::x(64));
    let mut rt = BlockRuntime::new(ArchConfig::volta(), ExecMode::Spmd, &spmd);
    rt.push_simd_limit(&Ident::UNKNOWN, 0, 1)?;
    rt.push_simd_limit(&Ident::UNKNOWN, 1, 3)?;
    let warp = Warp::new(0, rt.arch().simd_width);
    let teams = rt.convergent_simd_loop(warp, LaneMask(0b1011), |rt, team, member| {
        info!(
            source = team.lane_source,
            lane = member.lane,
            thread = rt.omp_thread_num(member.hw_lane)?,
            "simd lane"
        );
        Ok(())
    })?;
    println!("Convergent simd over lanes 0b1011 formed {} sub-teams", teams);

    Ok(())
}
