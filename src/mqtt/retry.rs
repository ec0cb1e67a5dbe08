use std::time::Duration;

/// Exponential backoff for reconnection attempts.
///
/// The n-th reconnection attempt waits `base * multiplier^(n-1)`. Once `max_attempts`
/// attempts have been scheduled without a successful connect in between,
/// [`RetryPolicy::next_delay`] returns `None` and the owner stops retrying on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
    attempt: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay before attempt number `attempt` (1-based), rounded to whole milliseconds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.round() as u64)
    }

    /// Counts the next attempt and returns how long to wait before it.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000), 1.5, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_grows_by_multiplier() {
        let mut policy = RetryPolicy::new(Duration::from_millis(3000), 1.5, 10);

        let delays: Vec<u128> = (0..4)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();

        assert_eq!(delays, vec![3000, 4500, 6750, 10125]);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(policy.attempt(), 4);
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut policy = RetryPolicy::new(Duration::from_millis(100), 2.0, 3);

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt(), 3);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut policy = RetryPolicy::new(Duration::from_millis(3000), 1.5, 2);
        policy.next_delay();
        policy.next_delay();
        assert!(policy.is_exhausted());

        policy.reset();

        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(3000)));
    }

    #[test]
    fn huge_exponents_saturate_instead_of_panicking() {
        let policy = RetryPolicy::new(Duration::from_millis(3000), 1.5, u32::MAX);

        assert!(policy.delay_for(u32::MAX) >= policy.delay_for(100));
    }
}
