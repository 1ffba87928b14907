use serde::{Deserialize, Serialize};

/// Persisted link bookkeeping.
///
/// `attempted == succeeded + failed` after every completed transmission;
/// the counters only move together through `record_success` and
/// `record_failure`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    joined: bool,
    attempted: u32,
    succeeded: u32,
    failed: u32,
    last_success_unix_s: Option<i64>,
    /// Consecutive join attempts since the last successful join. Not
    /// persisted: a reboot starts a fresh join budget.
    #[serde(skip)]
    join_attempts: u32,
    total_join_attempts: u32,
}

impl SessionState {
    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn attempted(&self) -> u32 {
        self.attempted
    }

    pub fn succeeded(&self) -> u32 {
        self.succeeded
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn last_success_unix_s(&self) -> Option<i64> {
        self.last_success_unix_s
    }

    pub fn join_attempts(&self) -> u32 {
        self.join_attempts
    }

    pub fn total_join_attempts(&self) -> u32 {
        self.total_join_attempts
    }

    /// Percentage of attempted transmissions that succeeded; 0 with none.
    pub fn success_rate(&self) -> f32 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f32 * 100.0 / self.attempted as f32
    }

    pub(crate) fn record_success(&mut self, unix_s: i64) {
        self.attempted = self.attempted.wrapping_add(1);
        self.succeeded = self.succeeded.wrapping_add(1);
        self.last_success_unix_s = Some(unix_s);
    }

    pub(crate) fn record_failure(&mut self) {
        self.attempted = self.attempted.wrapping_add(1);
        self.failed = self.failed.wrapping_add(1);
    }

    pub(crate) fn record_join_attempt(&mut self) {
        self.join_attempts = self.join_attempts.saturating_add(1);
        self.total_join_attempts = self.total_join_attempts.saturating_add(1);
    }

    pub(crate) fn mark_joined(&mut self) {
        self.joined = true;
        self.join_attempts = 0;
    }

    pub(crate) fn mark_unjoined(&mut self) {
        self.joined = false;
    }

    pub(crate) fn reset_statistics(&mut self) {
        self.attempted = 0;
        self.succeeded = 0;
        self.failed = 0;
    }

    /// Restores the counter invariant on a loaded record. Returns true if
    /// anything had to change.
    pub(crate) fn repair(&mut self) -> bool {
        let sum = self.succeeded.wrapping_add(self.failed);
        if self.attempted == sum {
            return false;
        }
        self.attempted = sum;
        true
    }
}
