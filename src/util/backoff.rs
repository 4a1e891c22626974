//! Jittered exponential backoff
//!
//! Used by the watch multiplexer, the kubeconfig source watcher, and the
//! event dispatcher. Delays double from `base` up to `cap`, with up to 25%
//! random jitter added so many streams reconnecting at once do not hammer an
//! API server in lockstep.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff state with jitter.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `base`, capped at `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Default policy for upstream watch reconnects: 500ms base, 30s cap.
    pub fn watch() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    /// Number of delays handed out since the last `reset`.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Next delay: `base * 2^attempt` capped at `cap`, plus up to 25% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt += 1;

        let raw = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap);

        let jitter = rand::rng().random_range(0.0..=0.25);
        raw.mul_f64(1.0 + jitter).min(self.cap.mul_f64(1.25))
    }

    /// Reset after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
