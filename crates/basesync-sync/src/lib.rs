//! Sync orchestration: the rate-limited page queue, per-cycle fetching and
//! the session that merges results and tracks status.

mod config;
mod error;
mod feed;
mod fetcher;
mod queue;
mod session;
#[cfg(test)]
mod testing;

pub use config::{
    ConfigError, SyncConfig, MAX_REQS_PER_SEC, PARSE_SETTLE_DELAY, RATE_LIMIT_DELAY, TASK_TIMEOUT,
};
pub use error::SyncError;
pub use feed::{StatusFeed, SyncEvent};
pub use fetcher::{
    build_query, modified_after_formula, PageFetcher, PageOutcome, PageTask, FILTER_PARAM,
    OFFSET_PARAM, RATE_LIMITED_STATUS,
};
pub use queue::{QueueError, QueueLimits, RateLimitedQueue, Task};
pub use session::{IdentityTransform, ResetHandle, SessionState, SyncSession, Transform};

pub const CRATE_NAME: &str = "basesync-sync";
