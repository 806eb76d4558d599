//! Worker threads, result channels and the stall watchdog.

mod channel;
mod deadlock;
mod pool;
mod retry;

pub use self::channel::{ChannelSender, TaskChannel};
pub use self::deadlock::{Activity, DeadlockDetector, ThreadRegistry};
pub use self::pool::ThreadPool;
pub use self::retry::{AutoRetryThreadPool, DEFAULT_MAX_RETRIES};

/// Lower values run first. The low byte is reserved for retry counts.
pub const PRIORITY_HIGH: u32 = 1 << 8;
pub const PRIORITY_MED: u32 = 2 << 8;
pub const PRIORITY_LOW: u32 = 3 << 8;

pub(crate) const RETRY_MASK: u32 = 0xFF;

/// Runs after everything else. Used for the poison tasks that stop workers.
pub(crate) const PRIORITY_STOP: u32 = u32::MAX;
