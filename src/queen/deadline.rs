//! Remaining-time budget for the collective wait

use std::time::{Duration, Instant};

/// Global deadline measured from a fixed start
///
/// Each wait is bounded by `budget - elapsed`, so the total time spent across
/// iterations never exceeds `budget`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Self::starting_at(Instant::now(), budget)
    }

    pub fn starting_at(start: Instant, budget: Duration) -> Self {
        Self { start, budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left at `now`, or `None` once the budget is spent
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.start);
        self.budget
            .checked_sub(elapsed)
            .filter(|left| !left.is_zero())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_shrinks_with_elapsed() {
        let start = Instant::now();
        let deadline = Deadline::starting_at(start, Duration::from_secs(10));

        assert_eq!(deadline.remaining_at(start), Some(Duration::from_secs(10)));
        assert_eq!(
            deadline.remaining_at(start + Duration::from_secs(3)),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            deadline.remaining_at(start + Duration::from_millis(9_999)),
            Some(Duration::from_millis(1))
        );
    }

    #[test]
    fn test_expired_budget_has_no_remaining() {
        let start = Instant::now();
        let deadline = Deadline::starting_at(start, Duration::from_secs(2));

        assert_eq!(deadline.remaining_at(start + Duration::from_secs(2)), None);
        assert_eq!(deadline.remaining_at(start + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_zero_budget_is_already_expired() {
        assert_eq!(Deadline::start(Duration::ZERO).remaining(), None);
    }
}
