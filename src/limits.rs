use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::GatewayError;

/// Sliding-window request counter for one client key.
///
/// Hits are a FIFO of timestamps; entries older than the window are evicted
/// on every check, so the queue length is bounded by the allowance and the
/// O(n) eviction stays cheap. Timestamps are non-decreasing because every
/// append uses the caller-supplied `now` after eviction against the same
/// `now`.
#[derive(Debug, Default)]
pub struct RateWindow {
    hits: VecDeque<Instant>,
}

impl RateWindow {
    /// Evict, test, and append in one step. Callers serialize access per key
    /// (the admission map lock), which gives two concurrent checks for the
    /// same key a serializable order.
    pub fn check(
        &mut self,
        now: Instant,
        window: Duration,
        allowed: usize,
    ) -> Result<(), GatewayError> {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) > window {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        if self.hits.len() >= allowed {
            return Err(GatewayError::RateLimited);
        }

        self.hits.push_back(now);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn admits_up_to_allowance_then_rejects() {
        let mut window = RateWindow::default();
        let now = Instant::now();
        for _ in 0..5 {
            window.check(now, WINDOW, 5).unwrap();
        }
        assert!(matches!(
            window.check(now, WINDOW, 5),
            Err(GatewayError::RateLimited)
        ));
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn old_hits_are_evicted_and_capacity_recovers() {
        let mut window = RateWindow::default();
        let start = Instant::now();
        for _ in 0..5 {
            window.check(start, WINDOW, 5).unwrap();
        }

        let later = start + Duration::from_millis(1500);
        window.check(later, WINDOW, 5).unwrap();
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn hits_inside_the_window_are_retained() {
        let mut window = RateWindow::default();
        let start = Instant::now();
        window.check(start, WINDOW, 10).unwrap();
        window
            .check(start + Duration::from_millis(900), WINDOW, 10)
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn rejection_does_not_consume_a_hit() {
        let mut window = RateWindow::default();
        let now = Instant::now();
        window.check(now, WINDOW, 1).unwrap();
        let _ = window.check(now, WINDOW, 1);
        let _ = window.check(now, WINDOW, 1);
        assert_eq!(window.len(), 1);
    }
}
