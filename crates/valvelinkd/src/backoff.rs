//! Exponential backoff with ±10% jitter, shared by BLE advertising
//! restart, BLE send back-pressure, and MQTT reconnect — each caller picks
//! its own initial/max bounds and resets on success.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms,
            current_ms: initial_ms,
        }
    }

    /// Jittered delay for the *next* failure, then doubles (capped) for
    /// the one after that.
    pub fn next_delay(&mut self) -> Duration {
        let jittered = jitter(self.current_ms);
        self.current_ms = (self.current_ms.saturating_mul(2)).min(self.max_ms);
        Duration::from_millis(jittered)
    }

    /// A success resets the delay to its initial value.
    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    /// Whether the delay about to be used by `next_delay()` is still at
    /// its initial value (i.e. no failure has grown it yet). Must be
    /// read before calling `next_delay()`, which mutates `current_ms` as
    /// a side effect of computing the delay it returns.
    pub fn is_initial(&self) -> bool {
        self.current_ms <= self.initial_ms
    }
}

fn jitter(ms: u64) -> u64 {
    let spread = (ms as f64 * 0.10) as i64;
    if spread == 0 {
        return ms;
    }
    let delta = rand::thread_rng().gen_range(-spread..=spread);
    (ms as i64 + delta).max(0) as u64
}

/// Opens after `threshold` consecutive failures, suppressing further
/// attempts for `cooldown_ms`; a single attempt is allowed through once
/// the cooldown expires (half-open).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown_ms: u64,
    consecutive_failures: u32,
    opened_at_ms: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            threshold,
            cooldown_ms,
            consecutive_failures: 0,
            opened_at_ms: None,
        }
    }

    pub fn is_open(&mut self, now_ms: u64) -> bool {
        match self.opened_at_ms {
            Some(opened) if now_ms.saturating_sub(opened) < self.cooldown_ms => true,
            Some(_) => {
                // Cooldown elapsed: half-open, allow exactly one probe.
                self.opened_at_ms = None;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at_ms = None;
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.opened_at_ms = Some(now_ms);
        }
    }
}
