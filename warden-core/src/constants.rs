//! Default values shared across crates.

/// Upper bound on client lookups while splitting a qualified role string.
pub const MAX_CLIENT_LOOKUPS: usize = 25;

/// Default maximum number of entries per revisioned cache.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

/// Default time-to-live for cached entries.
pub const DEFAULT_CACHE_ENTRY_TTL_SECS: u64 = 3600;

/// Default buffer size of the invalidation broadcast channel.
pub const DEFAULT_INVALIDATION_CHANNEL_CAPACITY: usize = 1024;

/// Default interval between scheduled-step polls.
pub const DEFAULT_SCHEDULER_POLL_INTERVAL_MS: u64 = 1_000;

/// Default number of scheduled records claimed per poll.
pub const DEFAULT_SCHEDULER_BATCH_SIZE: usize = 100;

/// Claims older than this are considered abandoned by a crashed node.
pub const DEFAULT_SCHEDULER_CLAIM_TIMEOUT_SECS: u64 = 300;

/// Default interval between stale-claim recovery passes.
pub const DEFAULT_SCHEDULER_RECLAIM_INTERVAL_SECS: u64 = 60;

/// Default cap on steps executed inline before a run must suspend.
pub const DEFAULT_MAX_INLINE_STEPS: usize = 1_000;

/// Default LMDB map size for the workflow state store.
pub const DEFAULT_STATE_MAX_SIZE_MB: usize = 64;
