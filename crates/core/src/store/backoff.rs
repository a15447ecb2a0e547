use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with jitter.
///
/// Yields `base * 2^k + rand[0, jitter_max]` for `k = 0..max_attempts`, then
/// terminates. Used to pace database close retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    jitter_max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, jitter_max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            jitter_max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Attempts issued so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(100), 3)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        let exp = self.base * 2u32.pow(self.attempt);
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };

        self.attempt += 1;
        Some(exp + jitter)
    }
}
