//! Sliding-window admission control per user.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::relay::session::SweeperHandle;

/// Per-user sliding-window rate limiter.
///
/// Keeps the request instants inside the trailing window for each user.
/// Instants older than the window are pruned lazily on every check, so
/// a retained sequence never exceeds the ceiling.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<i64, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check. Records the request instant only when admitted.
    ///
    /// A missing identifier (non-positive id) is rejected without
    /// touching any state. Never fails - this is a pure yes/no decision.
    pub fn is_allowed(&self, user_id: i64) -> bool {
        if user_id <= 0 {
            return false;
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let hits = windows.entry(user_id).or_default();

        while hits
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            hits.pop_front();
        }

        if hits.len() >= self.max_requests {
            debug!("Rate limit hit for user {user_id} ({} in window)", hits.len());
            return false;
        }

        hits.push_back(now);
        true
    }

    /// Drop users whose whole window has expired, so the map stays
    /// bounded for users who never come back. Returns how many entries
    /// were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let before = windows.len();
        let window = self.window;
        windows.retain(|_, hits| {
            hits.back()
                .is_some_and(|t| now.duration_since(*t) < window)
        });
        before - windows.len()
    }

    /// Spawn the periodic sweeper task. The returned handle aborts the
    /// task when dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweeperHandle {
        let limiter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    info!("Rate-limit sweep removed {removed} idle user(s)");
                }
            }
        });
        SweeperHandle::new(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_ceiling() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.is_allowed(7));
        }
        assert!(!limiter.is_allowed(7));
    }

    #[test]
    fn test_rejection_does_not_consume_budget() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.is_allowed(7));
        assert!(limiter.is_allowed(7));
        // Rejected calls must not extend the window.
        for _ in 0..10 {
            assert!(!limiter.is_allowed(7));
        }
        let windows = limiter.windows.lock().unwrap();
        assert_eq!(windows.get(&7).unwrap().len(), 2);
    }

    #[test]
    fn test_users_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.is_allowed(1));
        assert!(limiter.is_allowed(2));
        assert!(!limiter.is_allowed(1));
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));
        assert!(limiter.is_allowed(7));
        assert!(!limiter.is_allowed(7));
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.is_allowed(7));
    }

    #[test]
    fn test_sweep_drops_idle_users() {
        let limiter = RateLimiter::new(5, Duration::from_millis(30));
        assert!(limiter.is_allowed(7));
        assert!(limiter.is_allowed(8));
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(limiter.sweep(), 2);
        assert!(limiter.windows.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sweep_keeps_users_inside_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        assert!(limiter.is_allowed(7));
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.windows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_millis(10)));
        assert!(limiter.is_allowed(7));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _sweeper = limiter.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.windows.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_identifier_rejected_without_state() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        assert!(!limiter.is_allowed(0));
        assert!(!limiter.is_allowed(-1));
        assert!(limiter.windows.lock().unwrap().is_empty());
    }
}
