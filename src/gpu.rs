/// Top-level device model.
/// A GPU here is an architecture (SIMD width and warp activation rules) that
/// kernels are launched on; each block gets its own dispatch runtime.
use crate::arch::ArchConfig;
use crate::error::DispatchError;
use crate::executor::{ExecutionStats, KernelExecutor};
use crate::kernel::{Kernel, LaunchConfig};

pub struct GPU {
    pub arch: ArchConfig,
    /// Publish a metrics snapshot after every block for the `viz` binary
    pub live_metrics: bool,
}

impl GPU {
    pub fn new(arch: ArchConfig) -> Self {
        GPU {
            arch,
            live_metrics: false,
        }
    }

    /// sm_70 and later: partially filled warps cannot be scheduled.
    pub fn volta() -> Self {
        Self::new(ArchConfig::volta())
    }

    pub fn pascal() -> Self {
        Self::new(ArchConfig::pascal())
    }

    pub fn with_live_metrics(mut self) -> Self {
        self.live_metrics = true;
        self
    }

    /// Launch a kernel on every block of the grid.
    pub fn launch_kernel(
        &mut self,
        kernel: &Kernel,
        config: &LaunchConfig,
    ) -> Result<ExecutionStats, DispatchError> {
        let mut executor = KernelExecutor::new(self);
        executor.launch(kernel, config)
    }
}
