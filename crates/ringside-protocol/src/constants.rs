//! Protocol-wide defaults. Every timeout here is overridable through the
//! engine configuration surface.

/// Seconds a challengee has to accept or decline before the challenge expires.
pub const DEFAULT_ACCEPT_TIMEOUT_SECS: u64 = 30;

/// Seconds both participants have to show up in the voice channel after a
/// fight type is selected.
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 30;

/// Hard ceiling on fight duration in seconds.
pub const DEFAULT_MAX_FIGHT_SECS: u64 = 300;

/// Seconds between sampling ticks while a session is joining or active.
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 10;

/// Composite-score gap under which a volume fight is called a draw.
pub const DEFAULT_VOLUME_DRAW_THRESHOLD: f64 = 0.05;

/// Seconds the engine waits for a substitute watcher after an agent failure
/// before voiding the session.
pub const DEFAULT_AGENT_GRACE_SECS: u64 = 5;

/// Milliseconds a single watcher call (join/leave/poll/record) may take
/// before it is treated as an agent failure.
pub const DEFAULT_AGENT_CALL_TIMEOUT_MS: u64 = 2_000;

/// Consecutive ticks without a presence sample before a participant's
/// still-present flag clears.
pub const DEFAULT_MISSED_TICKS_BEFORE_ABSENT: u32 = 2;

/// Accepted backwards clock skew for out-of-order samples, in milliseconds.
/// Samples older than the newest accepted timestamp minus this tolerance are
/// discarded.
pub const DEFAULT_SKEW_TOLERANCE_MS: i64 = 2_000;

/// Attempts to persist a decided outcome before giving up.
pub const DEFAULT_PERSIST_RETRY_MAX: u32 = 3;

/// Base backoff between persistence attempts, in milliseconds. Doubles per
/// attempt.
pub const DEFAULT_PERSIST_RETRY_BACKOFF_MS: u64 = 200;

/// Cap on per-session timeline entries kept in memory. Oldest entries are
/// dropped first.
pub const SESSION_TIMELINE_CAP: usize = 200;
