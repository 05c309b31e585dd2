//! Longest-prefix retry policy selection for `ItemAbsent` handling. Rules
//! are consulted only when an item can't be resolved on a target node.

use crate::types::{PathSyncPolicy, RetryRule};

#[derive(Clone, Debug, Default)]
pub struct PolicyEngine {
    rules: Vec<PathSyncPolicy>,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PathSyncPolicy>) -> Self {
        Self { rules }
    }

    /// Selects the rule whose prefix is the longest match for `path`. No
    /// match fails immediately (`max_attempts = 0, delay = 0`).
    pub fn resolve(&self, path: &str) -> RetryRule {
        self.rules
            .iter()
            .filter(|rule| path.starts_with(rule.prefix.as_str()))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| RetryRule {
                max_attempts: rule.absent_retry_count,
                delay_seconds: rule.retry_delay_seconds,
            })
            .unwrap_or(RetryRule::FAIL_IMMEDIATELY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: &str, max_attempts: i32, delay: u64) -> PathSyncPolicy {
        PathSyncPolicy {
            prefix: prefix.to_string(),
            absent_retry_count: max_attempts,
            retry_delay_seconds: delay,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let engine = PolicyEngine::new(vec![
            rule("/mnt/nfs", 1, 60),
            rule("/mnt/nfs/movies", 5, 300),
        ]);
        let resolved = engine.resolve("/mnt/nfs/movies/x.mkv");
        assert_eq!(resolved.max_attempts, 5);
        assert_eq!(resolved.delay_seconds, 300);
    }

    #[test]
    fn no_match_fails_immediately() {
        let engine = PolicyEngine::new(vec![rule("/mnt/other", 5, 300)]);
        let resolved = engine.resolve("/mnt/nfs/movies/x.mkv");
        assert_eq!(resolved, RetryRule::FAIL_IMMEDIATELY);
    }

    #[test]
    fn unbounded_marker_preserved() {
        let engine = PolicyEngine::new(vec![rule("/mnt/nfs", -1, 60)]);
        let resolved = engine.resolve("/mnt/nfs/movies/x.mkv");
        assert!(resolved.is_unbounded());
    }
}
