//! Deadline folding for the background task hint.
//!
//! Every entry point reports when the engine next has time-driven work so
//! the host can sleep until then. A [`Deadline`] accumulates candidate
//! deadlines and yields the earliest one that is still in the future.

/// Accumulates the earliest future deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    now: u64,
    earliest: Option<u64>,
}

impl Deadline {
    /// The ceiling used when no work is scheduled at all.
    pub const IDLE_INTERVAL: u64 = 60_000;

    pub fn new(now: u64) -> Self {
        Self {
            now,
            earliest: None,
        }
    }

    /// Offer a candidate absolute deadline. Past deadlines clamp to
    /// "immediately after now": the work is due, the host should call back
    /// right away, but the hint must stay strictly in the future.
    pub fn offer(&mut self, at: u64) {
        let at = at.max(self.now + 1);
        self.earliest = Some(match self.earliest {
            Some(current) => current.min(at),
            None => at,
        });
    }

    /// Offer a candidate as `last + interval`.
    pub fn offer_interval(&mut self, last: u64, interval: u64) {
        self.offer(last.saturating_add(interval));
    }

    /// The resolved hint: the earliest offered deadline, or an idle tick.
    #[must_use]
    pub fn resolve(&self) -> u64 {
        self.earliest
            .unwrap_or(self.now + Self::IDLE_INTERVAL)
            .max(self.now + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_wins() {
        let mut dl = Deadline::new(1_000);
        dl.offer(5_000);
        dl.offer(3_000);
        dl.offer(9_000);
        assert_eq!(dl.resolve(), 3_000);
    }

    #[test]
    fn past_deadlines_clamp_to_immediate() {
        let mut dl = Deadline::new(1_000);
        dl.offer(500);
        assert_eq!(dl.resolve(), 1_001);
    }

    #[test]
    fn idle_when_nothing_offered() {
        let dl = Deadline::new(1_000);
        assert_eq!(dl.resolve(), 1_000 + Deadline::IDLE_INTERVAL);
    }

    #[test]
    fn interval_form() {
        let mut dl = Deadline::new(1_000);
        dl.offer_interval(900, 600);
        assert_eq!(dl.resolve(), 1_500);
        dl.offer_interval(u64::MAX - 10, 100);
        assert_eq!(dl.resolve(), 1_500);
    }

    #[test]
    fn always_strictly_future() {
        let mut dl = Deadline::new(0);
        dl.offer(0);
        assert!(dl.resolve() > 0);
    }
}
