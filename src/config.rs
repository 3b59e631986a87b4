use std::path::PathBuf;
use std::time::Duration;

/// Default piece size for back-source downloads; the scheduler dictates
/// piece geometry on the p2p path.
pub const DEFAULT_PIECE_SIZE: u32 = 4 * 1024 * 1024;

/// Capacity of the piece request channel and the failed piece channel. Both
/// must match to avoid a dispatch/retry dead-lock.
pub const DEFAULT_PIECE_CHAN_SIZE: usize = 16;

const DEFAULT_SCHEDULE_TIMEOUT: Duration = Duration::from_secs(300);

/// How the task talks to (and gives up on) the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// How long to wait for the first (or next) peer packet before falling
    /// back to the origin server.
    pub schedule_timeout: Duration,
    /// When set, a schedule timeout or unreachable scheduler fails the task
    /// instead of escalating to back-source.
    pub disable_auto_back_source: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            schedule_timeout: DEFAULT_SCHEDULE_TIMEOUT,
            disable_auto_back_source: false,
        }
    }
}

/// Per-task tunables supplied by the caller.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Piece size used when slicing an origin download.
    pub piece_size: u32,
    /// Per-task download rate limit in bytes per second; None disables
    /// limiting.
    pub per_peer_rate_limit: Option<u64>,
    /// Where the finished content is stored on completion.
    pub output: PathBuf,
}

impl TaskOptions {
    pub fn new(output: PathBuf) -> Self {
        TaskOptions {
            piece_size: DEFAULT_PIECE_SIZE,
            per_peer_rate_limit: None,
            output,
        }
    }
}
