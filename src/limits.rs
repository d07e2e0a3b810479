// Hard limits and defaults. Anything a deployment may want to tune lives in `config`.

/// Lock acquisition attempts on a slot before surfacing `Busy`.
pub const MAX_LOCK_ATTEMPTS: u32 = 3;

/// Default wait per lock attempt.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;

/// Simultaneously waiting entries allowed on one slot.
pub const DEFAULT_WAITLIST_CAP: u32 = 10;

/// Days of slots materialized ahead by the regeneration job.
pub const DEFAULT_HORIZON_DAYS: u32 = 15;
pub const MAX_HORIZON_DAYS: u32 = 60;

/// Students may not cancel closer than this to the slot start.
pub const DEFAULT_CANCEL_CUTOFF_MINUTES: i64 = 60;

/// A confirmed booking not checked in this long before its slot becomes a no-show.
pub const DEFAULT_CHECKIN_LEAD_MINUTES: i64 = 5;

pub const MAX_MACHINES: usize = 256;
pub const MAX_MACHINES_PER_PAIR: u32 = 8;

/// Max bytes in one wire request line.
pub const MAX_LINE_LEN: usize = 64 * 1024;
