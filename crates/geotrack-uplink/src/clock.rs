use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

/// Time as seen by the scheduler. Gates and retry delays use `now_ms`;
/// persisted timestamps use `unix_s`.
pub trait Clock {
    /// Monotonic milliseconds from an arbitrary origin.
    fn now_ms(&self) -> u64;

    /// Wall-clock Unix seconds.
    fn unix_s(&self) -> i64;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn unix_s(&self) -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }
}

/// Hand-driven clock for tests. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    ms: Arc<AtomicU64>,
    unix_base: i64,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with `unix_s() == unix_base` at `now_ms() == 0`.
    pub fn with_unix_base(unix_base: i64) -> Self {
        Self { ms: Arc::default(), unix_base }
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }

    fn unix_s(&self) -> i64 {
        self.unix_base + (self.now_ms() / 1000) as i64
    }
}
