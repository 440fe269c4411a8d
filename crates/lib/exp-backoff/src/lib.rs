//! Exponential backoff calculator with jitter.

use std::time::Duration;

use rand::Rng as _;

/// An exponential backoff state.
#[derive(Debug, Clone)]
pub struct State {
    /// Factor to multiply the current delay to calculate the next one.
    factor: u32,

    /// Upper bound for the random jitter added to each computed delay.
    jitter: Duration,

    /// Delay floor.
    min: Duration,

    /// Delay clamp.
    max: Duration,

    /// Precomputed delay value to return.
    value: Duration,
}

impl State {
    /// Create a state that hands out `min` first.
    pub fn new(factor: u32, jitter: Duration, min: Duration, max: Duration) -> Self {
        Self {
            factor,
            jitter,
            min,
            max,
            value: min,
        }
    }

    /// Obtain the stored delay value and precompute the next one.
    pub fn advance(&mut self) -> Duration {
        let current = self.value;
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            let millis = self.jitter.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(0..millis))
        };
        self.value = current
            .saturating_mul(self.factor)
            .saturating_add(jitter)
            .clamp(self.min, self.max);
        current
    }

    /// Peek the stored delay value.
    pub const fn peek(&self) -> Duration {
        self.value
    }

    /// Return to the initial delay.
    pub fn reset(&mut self) {
        self.value = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_with_bounded_jitter() {
        let mut state = State::new(
            2,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(64),
        );

        assert_eq!(state.advance(), Duration::from_secs(1));

        let second = state.advance();
        assert!(second >= Duration::from_secs(2));
        assert!(second < Duration::from_secs(3));

        let third = state.advance();
        assert!(third >= second.saturating_mul(2));
        assert!(third < second.saturating_mul(2) + Duration::from_secs(1));
    }

    #[test]
    fn clamps_to_max() {
        let mut state = State::new(
            2,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(4),
        );

        for _ in 0..16 {
            state.advance();
        }
        assert_eq!(state.peek(), Duration::from_secs(4));
    }

    #[test]
    fn reset_returns_to_min() {
        let mut state = State::new(
            2,
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(64),
        );

        state.advance();
        state.advance();
        assert!(state.peek() > Duration::from_secs(1));

        state.reset();
        assert_eq!(state.peek(), Duration::from_secs(1));
        assert_eq!(state.advance(), Duration::from_secs(1));
    }
}
