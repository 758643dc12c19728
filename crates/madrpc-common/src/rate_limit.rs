//! Retry Rate Limiting for MaDRPC
//!
//! This module caps how many retries each flow-control strategy may issue per
//! wall-clock second. Retries amplify load exactly when backends are already
//! slow, so every strategy gets a per-second budget.
//!
//! # Architecture
//!
//! - One [`RetryCheckerItem`] per strategy, created lazily on first use and
//!   kept for the life of the process
//! - The strategy map is guarded by a coarse `RwLock` that is only written
//!   when a new strategy shows up
//! - Each item has its own lock, so unrelated strategies never contend
//!
//! # Example
//!
//! ```
//! use madrpc_common::rate_limit::RetryLimitChecker;
//!
//! let checker = RetryLimitChecker::new();
//!
//! // Two retries per second for "s1"
//! assert!(checker.can_retry("s1", 100, 2));
//! assert!(checker.can_retry("s1", 100, 2));
//! assert!(!checker.can_retry("s1", 100, 2));
//!
//! // A new second restores the budget
//! assert!(checker.can_retry("s1", 101, 2));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Per-second admission state for a single strategy.
#[derive(Debug)]
struct RetryWindow {
    /// Retries admitted during `second`
    count: i64,
    /// Wall-clock second the count belongs to
    second: i64,
}

/// Retry budget for one strategy.
#[derive(Debug)]
pub struct RetryCheckerItem {
    window: Mutex<RetryWindow>,
}

impl RetryCheckerItem {
    fn new() -> Self {
        Self {
            window: Mutex::new(RetryWindow {
                count: 0,
                second: i64::MIN,
            }),
        }
    }

    /// Attempts to admit one retry in `now_seconds`.
    ///
    /// The count resets to 1 whenever the second changes, so the first retry
    /// of a second is always admitted. Within a second the count only grows.
    fn try_admit(&self, strategy: &str, now_seconds: i64, limit: i64) -> bool {
        let mut window = self.window.lock().unwrap();
        if window.second != now_seconds {
            window.second = now_seconds;
            window.count = 1;
            return true;
        }

        if window.count >= limit {
            return false;
        }

        window.count += 1;
        if window.count == limit {
            warn!(
                "Retry limit reached for strategy '{}': {} retries in second {}",
                strategy, limit, now_seconds
            );
        }
        true
    }

    /// Retries admitted in the current second.
    pub fn count_this_second(&self) -> i64 {
        self.window.lock().unwrap().count
    }
}

/// Per-strategy retry admission control.
///
/// # Thread Safety
///
/// Safe to share across threads behind an `Arc`. Lookups take the map's read
/// lock only long enough to clone the item handle; the admission itself runs
/// under the item's own lock.
#[derive(Debug, Default)]
pub struct RetryLimitChecker {
    items: RwLock<HashMap<String, Arc<RetryCheckerItem>>>,
}

impl RetryLimitChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether one more retry for `strategy` fits into `now_seconds`.
    ///
    /// # Arguments
    ///
    /// * `strategy` - Flow-control strategy name
    /// * `now_seconds` - Current wall-clock second
    /// * `limit` - Retries allowed per second; negative means unlimited
    ///
    /// # Returns
    ///
    /// `true` if the retry is admitted
    pub fn can_retry(&self, strategy: &str, now_seconds: i64, limit: i64) -> bool {
        if limit < 0 {
            return true;
        }
        self.get_or_create(strategy)
            .try_admit(strategy, now_seconds, limit)
    }

    /// Number of strategies that have been seen so far.
    pub fn tracked_strategy_count(&self) -> usize {
        self.items.read().unwrap().len()
    }

    /// Returns the item for `strategy`, if it was ever used.
    pub fn item(&self, strategy: &str) -> Option<Arc<RetryCheckerItem>> {
        self.items.read().unwrap().get(strategy).cloned()
    }

    /// Double-checked lookup: read lock first, write lock only to insert.
    fn get_or_create(&self, strategy: &str) -> Arc<RetryCheckerItem> {
        if let Some(item) = self.items.read().unwrap().get(strategy) {
            return item.clone();
        }

        let mut items = self.items.write().unwrap();
        items
            .entry(strategy.to_string())
            .or_insert_with(|| Arc::new(RetryCheckerItem::new()))
            .clone()
    }
}

/// Seconds since the Unix epoch, or 0 if the clock is before it.
pub fn current_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_negative_limit_is_unlimited() {
        let checker = RetryLimitChecker::new();
        for _ in 0..1000 {
            assert!(checker.can_retry("s", 100, -1));
        }
        // Unlimited checks never create an entry
        assert_eq!(checker.tracked_strategy_count(), 0);
    }

    #[test]
    fn test_limit_sequence_within_one_second() {
        let checker = RetryLimitChecker::new();
        let results: Vec<bool> = (0..5).map(|_| checker.can_retry("s", 100, 3)).collect();
        assert_eq!(results, vec![true, true, true, false, false]);
        assert!(checker.can_retry("s", 101, 3));
    }

    #[test]
    fn test_count_resets_on_new_second() {
        let checker = RetryLimitChecker::new();
        assert!(checker.can_retry("s", 100, 1));
        assert!(!checker.can_retry("s", 100, 1));
        assert!(checker.can_retry("s", 101, 1));
        assert_eq!(checker.item("s").unwrap().count_this_second(), 1);

        // Going backwards is also a different second
        assert!(checker.can_retry("s", 100, 1));
    }

    #[test]
    fn test_zero_limit_admits_first_retry_of_each_second() {
        let checker = RetryLimitChecker::new();
        assert!(checker.can_retry("s", 100, 0));
        assert!(!checker.can_retry("s", 100, 0));
        assert!(checker.can_retry("s", 101, 0));
    }

    #[test]
    fn test_strategies_are_independent() {
        let checker = RetryLimitChecker::new();
        assert!(checker.can_retry("a", 100, 1));
        assert!(!checker.can_retry("a", 100, 1));
        assert!(checker.can_retry("b", 100, 1));
        assert_eq!(checker.tracked_strategy_count(), 2);
    }

    #[test]
    fn test_concurrent_admissions_respect_limit() {
        let checker = Arc::new(RetryLimitChecker::new());
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let checker = checker.clone();
                let admitted = admitted.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        if checker.can_retry("shared", 500, 10) {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::Relaxed), 10);
        assert_eq!(checker.tracked_strategy_count(), 1);
    }

    #[test]
    fn test_current_unix_seconds_is_positive() {
        assert!(current_unix_seconds() > 0);
    }
}
