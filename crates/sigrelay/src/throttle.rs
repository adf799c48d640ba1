use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute message counter for a single connection.
///
/// Timestamps older than the window fall off the front, so a burst straddling
/// a minute boundary is still counted as one burst.
#[derive(Debug)]
pub struct Throttle {
    limit: u32,
    sent: VecDeque<Instant>,
}

impl Throttle {
    /// Allow at most `per_minute` messages in any 60-second window.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        Self {
            limit: per_minute,
            sent: VecDeque::with_capacity(per_minute.min(64) as usize),
        }
    }

    /// Record a message at `now` if it fits; returns `false` when over the limit.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.sent.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() >= self.limit as usize {
            return false;
        }
        self.sent.push_back(now);
        true
    }

    /// [`allow_at`](Self::allow_at) with the current time.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit() {
        let mut throttle = Throttle::new(3);
        let now = Instant::now();
        assert!(throttle.allow_at(now));
        assert!(throttle.allow_at(now));
        assert!(throttle.allow_at(now));
        assert!(!throttle.allow_at(now));
    }

    #[test]
    fn rejected_messages_are_not_recorded() {
        let mut throttle = Throttle::new(1);
        let now = Instant::now();
        assert!(throttle.allow_at(now));
        for _ in 0..10 {
            assert!(!throttle.allow_at(now));
        }
        assert_eq!(throttle.sent.len(), 1);
    }

    #[test]
    fn old_messages_expire() {
        let mut throttle = Throttle::new(2);
        let start = Instant::now();
        assert!(throttle.allow_at(start));
        assert!(throttle.allow_at(start + Duration::from_secs(30)));
        assert!(!throttle.allow_at(start + Duration::from_secs(59)));
        // The first message leaves the window at t=60.
        assert!(throttle.allow_at(start + Duration::from_secs(60)));
        assert!(!throttle.allow_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn burst_across_minute_boundary_is_limited() {
        let mut throttle = Throttle::new(10);
        let start = Instant::now();
        for i in 0..10 {
            assert!(throttle.allow_at(start + Duration::from_millis(59_000 + i * 10)));
        }
        assert!(!throttle.allow_at(start + Duration::from_millis(60_500)));
    }
}
