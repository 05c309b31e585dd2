use serde::{Deserialize, Serialize};

/// One path-prefixed retry rule from `path_sync_policy[]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathSyncPolicy {
    pub prefix: String,
    /// `-1` means unbounded.
    pub absent_retry_count: i32,
    pub retry_delay_seconds: u64,
}

/// Resolved rule for a given item path: longest matching prefix wins.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryRule {
    pub max_attempts: i32,
    pub delay_seconds: u64,
}

impl RetryRule {
    pub const FAIL_IMMEDIATELY: RetryRule = RetryRule {
        max_attempts: 0,
        delay_seconds: 0,
    };

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == -1
    }
}
