/// Live metrics for the TUI visualizer.
///
/// When live metrics are enabled the executor writes a JSON snapshot to
/// METRICS_PATH after every block. The viz binary polls this file and
/// re-renders the dashboard. Writes are atomic (write to .tmp then rename)
/// to avoid torn reads.
use serde::{Deserialize, Serialize};

pub const METRICS_PATH: &str = "/tmp/simtomp_live.json";

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveMetrics {
    /// "idle" | "running" | "complete"
    pub status: String,
    pub kernel_name: String,
    /// Architecture name, e.g. "sm_70"
    pub arch: String,
    /// Display form of `ExecMode`: "generic" | "SPMD"
    pub mode: String,
    /// Grid dimensions [x, y, z]
    pub grid: [u32; 3],
    /// Block dimensions [x, y, z]
    pub block: [u32; 3],
    pub blocks_total: u32,
    pub blocks_executed: u32,
    pub simd_width: u32,
    /// Lanes a parallel region may use in this launch
    pub available_lanes: u32,
    /// Level-1 regions dispatched so far
    pub regions: u32,
    pub activations: u32,
    pub serialized_regions: u32,
    pub convergent_teams: u32,
    /// Team size of the last region of the last block
    pub last_team_size: u32,
    /// Which bound decided `last_team_size`
    pub last_limiter: String,
    /// Lanes that ran the last region, index = hardware lane
    pub lane_active: Vec<bool>,
    /// Barrier arrivals per hardware lane in the last block
    #[serde(default)]
    pub barrier_arrivals: Vec<u64>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

/// Atomically write metrics to METRICS_PATH.
pub fn write_metrics(metrics: &LiveMetrics) {
    if let Ok(json) = serde_json::to_string(metrics) {
        let tmp = format!("{}.tmp", METRICS_PATH);
        if std::fs::write(&tmp, &json).is_ok() {
            let _ = std::fs::rename(&tmp, METRICS_PATH);
        }
    }
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no launch has run yet).
pub fn read_metrics() -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(METRICS_PATH).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_field_uses_exec_mode_display() {
        use crate::kernel::ExecMode;
        assert_eq!(ExecMode::Generic.to_string(), "generic");
        assert_eq!(ExecMode::Spmd.to_string(), "SPMD");
    }

    #[test]
    fn old_snapshots_without_barrier_counts_still_parse() {
        let mut value = serde_json::to_value(LiveMetrics::default()).unwrap();
        value.as_object_mut().unwrap().remove("barrier_arrivals");
        let parsed: LiveMetrics = serde_json::from_value(value).unwrap();
        assert!(parsed.barrier_arrivals.is_empty());
    }
}
