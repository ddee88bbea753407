/// Fatal dispatch conditions.
/// Every variant is a broken calling contract: the executor aborts the whole
/// block instead of letting inconsistent per-lane state reach the next barrier.
use thiserror::Error;

use crate::warp::LaneMask;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("expected an initialized runtime")]
    RuntimeUninitialized,

    #[error("parallel region prepared while already inside a parallel region")]
    AlreadyInParallel,

    #[error("lane {lane} is not the team master")]
    NotMaster { lane: u32 },

    #[error("lane {lane} is not a worker lane")]
    NotWorker { lane: u32 },

    #[error("bad thread request of {team_size} threads")]
    InvalidTeamSize { team_size: u32 },

    #[error("the number of teams is fixed at launch and cannot be changed from a kernel")]
    NumTeamsUnsupported,

    #[error("no unprocessed lanes left in mask {mask} at cursor {cursor}")]
    NoRemainingLanes { mask: LaneMask, cursor: u32 },

    #[error("convergent source lane {lane} is not part of the activity mask")]
    SourceLaneInactive { lane: u32 },

    #[error("task context stack of thread {thread} is empty")]
    ContextUnderflow { thread: u32 },

    #[error("thread {thread} left a parallel region with unbalanced nested contexts")]
    UnbalancedExit { thread: u32 },

    #[error("worker received a work function that was never published")]
    UnknownWorkFn,

    #[error("lane {lane} is outside the block ({limit} lanes)")]
    LaneOutOfRange { lane: u32, limit: u32 },

    #[error("barrier misaligned: lane arrivals range from {min} to {max}")]
    BarrierMisaligned { min: u64, max: u64 },

    #[error("invalid launch configuration: {0}")]
    Config(#[from] serde_json::Error),
}
