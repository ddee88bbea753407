pub mod arch;
pub mod context;
pub mod convergent;
pub mod error;
pub mod executor;
pub mod gpu;
pub mod kernel;
pub mod metrics;
pub mod parallel;
pub mod state;
pub mod sync;
pub mod warp;
pub mod work;

#[cfg(test)]
mod proptests;
