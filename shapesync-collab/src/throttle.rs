//! Cooperative flush rate limiter.
//!
//! A single-shot timer: the first notification after a flush schedules one
//! flush at `max(now, last_flush + interval)`; every further notification
//! before that deadline is absorbed into it. Flushing never happens inside
//! `notify` itself, only when the owner polls on a later tick.

use std::time::{Duration, Instant};

/// Outcome of [`FlushThrottle::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// A new flush was scheduled for the deadline.
    Scheduled(Instant),
    /// A flush was already pending; the notification joins it.
    Coalesced(Instant),
}

#[derive(Debug, Clone)]
pub struct FlushThrottle {
    interval: Duration,
    last_flush: Option<Instant>,
    pending: Option<Instant>,
}

impl FlushThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
            pending: None,
        }
    }

    pub fn notify(&mut self, now: Instant) -> ThrottleDecision {
        if let Some(deadline) = self.pending {
            return ThrottleDecision::Coalesced(deadline);
        }
        let deadline = match self.last_flush {
            Some(last) => (last + self.interval).max(now),
            None => now,
        };
        self.pending = Some(deadline);
        ThrottleDecision::Scheduled(deadline)
    }

    /// Deadline of the pending flush, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.pending.is_some_and(|deadline| deadline <= now)
    }

    /// Consume the pending flush if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn mark_flushed(&mut self, now: Instant) {
        self.last_flush = Some(now);
    }

    /// Drop the pending flush without flushing.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(33);

    #[test]
    fn test_first_notify_due_immediately() {
        let t0 = Instant::now();
        let mut throttle = FlushThrottle::new(WINDOW);
        assert_eq!(throttle.notify(t0), ThrottleDecision::Scheduled(t0));
        assert!(throttle.take_due(t0));
        assert!(!throttle.is_pending());
    }

    #[test]
    fn test_notifications_coalesce() {
        let t0 = Instant::now();
        let mut throttle = FlushThrottle::new(WINDOW);
        throttle.notify(t0);
        for ms in 1..10 {
            assert_eq!(
                throttle.notify(t0 + Duration::from_millis(ms)),
                ThrottleDecision::Coalesced(t0)
            );
        }
        assert!(throttle.take_due(t0 + Duration::from_millis(10)));
        assert!(!throttle.take_due(t0 + Duration::from_millis(11)));
    }

    #[test]
    fn test_deadline_respects_interval_after_flush() {
        let t0 = Instant::now();
        let mut throttle = FlushThrottle::new(WINDOW);
        throttle.mark_flushed(t0);

        let decision = throttle.notify(t0 + Duration::from_millis(5));
        assert_eq!(decision, ThrottleDecision::Scheduled(t0 + WINDOW));
        assert!(!throttle.take_due(t0 + Duration::from_millis(32)));
        assert!(throttle.take_due(t0 + WINDOW));
    }

    #[test]
    fn test_idle_past_window_is_due_now() {
        let t0 = Instant::now();
        let mut throttle = FlushThrottle::new(WINDOW);
        throttle.mark_flushed(t0);

        let later = t0 + Duration::from_millis(500);
        assert_eq!(throttle.notify(later), ThrottleDecision::Scheduled(later));
    }

    #[test]
    fn test_cancel_drops_pending() {
        let t0 = Instant::now();
        let mut throttle = FlushThrottle::new(WINDOW);
        throttle.notify(t0);
        throttle.cancel();
        assert_eq!(throttle.deadline(), None);
        assert!(!throttle.take_due(t0 + WINDOW));
    }
}
