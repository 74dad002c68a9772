// Copyright (c) 2025 SkipSet Contributors
//
// Backoff strategy for CAS retry loops
//
// Losing a compare-and-swap race means another thread is making progress;
// spinning briefly before retrying keeps the cache line from ping-ponging,
// and yielding after a few rounds keeps an oversubscribed core from
// starving the winner.

/// Exponential spin backoff that escalates to a scheduler yield.
pub struct Backoff {
    step: u32,
    max_step: u32,
}

/// Rounds of pure spinning before `snooze` starts yielding.
const YIELD_THRESHOLD: u32 = 3;

impl Backoff {
    /// Create a new backoff strategy
    pub fn new() -> Self {
        Self {
            step: 0,
            max_step: 10,
        }
    }

    /// Perform a backoff step
    pub fn spin(&mut self) {
        for _ in 0..(1 << self.step.min(self.max_step)) {
            std::hint::spin_loop();
        }
        self.step = self.step.saturating_add(1);
    }

    /// Reset backoff to initial state
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Check if we should yield to the scheduler
    pub fn should_yield(&self) -> bool {
        self.step > YIELD_THRESHOLD
    }

    /// Snooze - either spin or yield
    pub fn snooze(&mut self) {
        if self.should_yield() {
            std::thread::yield_now();
            self.step = self.step.saturating_add(1);
        } else {
            self.spin();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_steps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.step, 0);
        assert!(!backoff.should_yield());

        backoff.spin();
        assert_eq!(backoff.step, 1);

        backoff.reset();
        assert_eq!(backoff.step, 0);
    }

    #[test]
    fn test_backoff_escalates_to_yield() {
        let mut backoff = Backoff::new();
        for _ in 0..=YIELD_THRESHOLD {
            backoff.snooze();
        }
        assert!(backoff.should_yield());
        // Yielding must still advance the step counter.
        let before = backoff.step;
        backoff.snooze();
        assert!(backoff.step > before);
    }
}
