use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand_core::{OsRng, RngCore};

/// Upper bound of the jitter term as a fraction of the exponential term.
pub const JITTER_RATIO: f64 = 0.1;

/// Exponential backoff with bounded jitter.
///
/// `jitter_fraction` is expected in `[0, 1]` and is clamped otherwise. The
/// result is `min(base * 2^attempt + jitter, cap)` with saturating arithmetic.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration, jitter_fraction: f64) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt));
    let fraction = if jitter_fraction.is_finite() { jitter_fraction.clamp(0.0, 1.0) } else { 0.0 };
    let jitter = exponential.mul_f64(JITTER_RATIO * fraction);
    exponential.saturating_add(jitter).min(cap)
}

/// Samples [`backoff_delay`] jitter from an injected random source.
///
/// Cloning shares the random source, so one scheduler can be handed to an
/// executor and every connection manager of a hub.
#[derive(Clone)]
pub struct BackoffScheduler {
    rng: Arc<Mutex<Box<dyn RngCore + Send>>>,
}

impl BackoffScheduler {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }

    pub fn with_rng<R: RngCore + Send + 'static>(rng: R) -> Self {
        Self { rng: Arc::new(Mutex::new(Box::new(rng))) }
    }

    /// A scheduler whose delays are exactly `base * 2^attempt` (capped).
    pub fn without_jitter() -> Self {
        Self::with_rng(NoJitter)
    }

    pub fn delay(&self, attempt: u32, base: Duration, cap: Duration) -> Duration {
        let sample = self.rng.lock().expect("backoff rng mutex poisoned").next_u32();
        backoff_delay(attempt, base, cap, f64::from(sample) / f64::from(u32::MAX))
    }
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackoffScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffScheduler").finish_non_exhaustive()
    }
}

struct NoJitter;

impl RngCore for NoJitter {
    fn next_u32(&mut self) -> u32 {
        0
    }

    fn next_u64(&mut self) -> u64 {
        0
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(0);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        dest.fill(0);
        Ok(())
    }
}
