//! Bandwidth limiter for bucket copy traffic.

use std::time::Instant;

use parking_lot::Mutex;

/// Token bucket limiting migration copy bandwidth. Tokens are bytes; the
/// bucket refills continuously at the configured rate and caps at one
/// second's worth of burst.
pub struct TransferThrottle {
    rate_bytes_per_sec: u64,
    state: Mutex<ThrottleState>,
}

struct ThrottleState {
    tokens: f64,
    last_refill: Instant,
}

impl TransferThrottle {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate_bytes_per_sec,
            state: Mutex::new(ThrottleState {
                tokens: rate_bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume `bytes` tokens. Returns false when the caller should
    /// back off and retry the batch later.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= bytes as f64 {
            state.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Bytes currently available without waiting.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as u64
    }

    fn refill(&self, state: &mut ThrottleState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let cap = self.rate_bytes_per_sec as f64;
            state.tokens = (state.tokens + elapsed * cap).min(cap);
            state.last_refill = Instant::now();
        }
    }
}
