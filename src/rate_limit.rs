use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Blocking sleep, behind a trait so pacing and backoff can be observed in tests.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Provider-wide minimum spacing between outbound calls.
pub struct RateLimiter<S: Sleeper> {
    delay: Duration,
    last_call: Option<Instant>,
    sleeper: S,
}

impl<S: Sleeper> RateLimiter<S> {
    pub fn new(delay: Duration, sleeper: S) -> Self {
        Self {
            delay,
            last_call: None,
            sleeper,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Blocks until `delay` has elapsed since the previous call. The first call never blocks.
    pub fn wait_if_needed(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                let remaining = self.delay - elapsed;
                debug!(wait_ms = remaining.as_millis() as u64, "rate limiter pacing");
                self.sleeper.sleep(remaining);
            }
        }
        self.last_call = Some(Instant::now());
    }
}
