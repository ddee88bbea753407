/// Kernel definitions and launch configuration.
/// A target-region kernel runs on every block of the grid. In generic mode
/// one master lane runs the sequential part and hands parallel regions to the
/// worker lanes; in SPMD mode every lane runs the body from the start.
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::executor::{MasterCtx, RegionCtx};

/// 3D dimension struct used for grid and block sizes (mirrors CUDA's dim3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D configs
    pub fn x(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    /// Total number of threads/blocks in this dimension
    pub fn size(&self) -> u32 {
        self.x * self.y * self.z
    }
}

/// How the compiler lowered the target region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    /// Master/worker state machine: the last warp's first lane drives.
    Generic,
    /// Every lane executes the region body from kernel entry.
    Spmd,
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Generic => write!(f, "generic"),
            ExecMode::Spmd => write!(f, "SPMD"),
        }
    }
}

/// Host-side launch configuration for one kernel invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    /// `false` only for SPMD kernels compiled without the full runtime.
    #[serde(default = "default_true")]
    pub runtime_initialized: bool,
    /// `thread_limit` clause of the enclosing teams construct (0 = unset).
    #[serde(default)]
    pub thread_limit: u32,
}

fn default_true() -> bool {
    true
}

impl LaunchConfig {
    pub fn new(grid_dim: Dim3, block_dim: Dim3) -> Self {
        LaunchConfig {
            grid_dim,
            block_dim,
            runtime_initialized: true,
            thread_limit: 0,
        }
    }

    pub fn with_thread_limit(mut self, thread_limit: u32) -> Self {
        self.thread_limit = thread_limit;
        self
    }

    /// Launch without the full runtime (SPMD kernels only).
    pub fn uninitialized(mut self) -> Self {
        self.runtime_initialized = false;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Total number of thread blocks in the grid
    pub fn num_blocks(&self) -> u32 {
        self.grid_dim.size()
    }

    /// Total number of threads per block
    pub fn threads_per_block(&self) -> u32 {
        self.block_dim.size()
    }
}

/// Shape of one block as seen by the runtime: how hardware lanes map onto
/// master, workers and logical OpenMP thread ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    pub block_size: u32,
    pub simd_width: u32,
    pub mode: ExecMode,
}

impl BlockShape {
    pub fn new(block_size: u32, simd_width: u32, mode: ExecMode) -> Self {
        BlockShape { block_size, simd_width, mode }
    }

    /// The team master is the first lane of the last warp.
    pub fn master_lane(&self) -> u32 {
        self.block_size.saturating_sub(1) & !(self.simd_width - 1)
    }

    /// Lanes that can be handed a parallel region.
    /// Generic mode reserves the whole master warp; SPMD uses every lane.
    pub fn available_lanes(&self) -> u32 {
        match self.mode {
            ExecMode::Generic => self.master_lane(),
            ExecMode::Spmd => self.block_size,
        }
    }

    /// Logical thread id of a hardware lane. In generic mode the master warp
    /// shadows logical thread 0.
    pub fn logical_thread_id(&self, hw_lane: u32) -> u32 {
        match self.mode {
            ExecMode::Generic if hw_lane >= self.master_lane() => 0,
            _ => hw_lane,
        }
    }
}

/// Signature of the sequential part of a generic-mode kernel.
pub type MasterFn = dyn Fn(&mut MasterCtx<'_>) -> Result<(), DispatchError>;

/// Signature of an outlined parallel region body, and of SPMD kernels.
pub type RegionFn = dyn Fn(&mut RegionCtx<'_>) -> Result<(), DispatchError>;

pub enum KernelBody {
    Generic(Box<MasterFn>),
    Spmd(Box<RegionFn>),
}

/// A GPU kernel: a named target region executed by every block of the grid.
pub struct Kernel {
    pub name: String,
    pub body: KernelBody,
}

impl Kernel {
    /// Generic-mode kernel: `func` runs on the master lane only.
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut MasterCtx<'_>) -> Result<(), DispatchError> + 'static,
    {
        Kernel {
            name: name.to_string(),
            body: KernelBody::Generic(Box::new(func)),
        }
    }

    /// SPMD kernel: `func` runs on every lane of the block.
    pub fn spmd<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut RegionCtx<'_>) -> Result<(), DispatchError> + 'static,
    {
        Kernel {
            name: name.to_string(),
            body: KernelBody::Spmd(Box::new(func)),
        }
    }

    pub fn mode(&self) -> ExecMode {
        match self.body {
            KernelBody::Generic(_) => ExecMode::Generic,
            KernelBody::Spmd(_) => ExecMode::Spmd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_is_first_lane_of_last_warp() {
        let shape = BlockShape::new(128, 32, ExecMode::Generic);
        assert_eq!(shape.master_lane(), 96);
        assert_eq!(shape.available_lanes(), 96);
        assert_eq!(shape.logical_thread_id(96), 0);
        assert_eq!(shape.logical_thread_id(100), 0);
        assert_eq!(shape.logical_thread_id(95), 95);

        // partial last warp
        let shape = BlockShape::new(100, 32, ExecMode::Generic);
        assert_eq!(shape.master_lane(), 96);
    }

    #[test]
    fn spmd_uses_every_lane() {
        let shape = BlockShape::new(128, 32, ExecMode::Spmd);
        assert_eq!(shape.available_lanes(), 128);
        assert_eq!(shape.logical_thread_id(100), 100);
    }

    #[test]
    fn launch_config_from_json_defaults() {
        let cfg = LaunchConfig::from_json(
            r#"{"grid_dim":{"x":2,"y":1,"z":1},"block_dim":{"x":96,"y":1,"z":1}}"#,
        )
        .unwrap();
        assert!(cfg.runtime_initialized);
        assert_eq!(cfg.thread_limit, 0);
        assert_eq!(cfg.num_blocks(), 2);
        assert_eq!(cfg.threads_per_block(), 96);
        assert!(LaunchConfig::from_json("{").is_err());
    }
}
