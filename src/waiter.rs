//! Request pacing: jittered pauses, per-host token buckets and backoff.
//!
//! Everything here sleeps through a [`Clock`], so tests can drive time by hand.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use rand::Rng;

use crate::cancel::CancelToken;

/// Sleeps are sliced so cancellation is noticed promptly.
const SLICE: Duration = Duration::from_millis(250);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A closed range of durations to pick a random pause from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Band {
    min: Duration,
    max: Duration,
}

impl Band {
    pub fn new(a: Duration, b: Duration) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn secs(a: f64, b: f64) -> Self {
        Self::new(Duration::from_secs_f64(a), Duration::from_secs_f64(b))
    }

    #[cfg(test)]
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let secs = rng.random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.min.as_secs_f64(),
            self.max.as_secs_f64()
        )
    }
}

/// Parses `MIN..MAX` or a single number of seconds.
impl FromStr for Band {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn secs(s: &str) -> Result<f64, String> {
            let value: f64 = s
                .trim()
                .parse()
                .map_err(|_| format!("{:?} is not a number of seconds", s))?;
            if value.is_finite() && value >= 0.0 {
                Ok(value)
            } else {
                Err(format!("{:?} is not a usable delay", s))
            }
        }

        match s.split_once("..") {
            Some((a, b)) => Ok(Band::secs(secs(a)?, secs(b)?)),
            None => {
                let value = secs(s)?;
                Ok(Band::secs(value, value))
            }
        }
    }
}

/// Exponential backoff with jitter, plus a separate wait band for
/// connection resets.
#[derive(Copy, Clone, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Band,
    pub reset: Band,
    /// Added to the reset wait once per prior attempt.
    pub reset_step: Duration,
}

impl Backoff {
    pub fn pages() -> Self {
        Self {
            base: Duration::from_secs(6),
            cap: Duration::from_secs(45),
            jitter: Band::secs(0.0, 2.0),
            reset: Band::secs(20.0, 40.0),
            reset_step: Duration::ZERO,
        }
    }

    pub fn downloads() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(20),
            jitter: Band::secs(0.0, 5.0),
            reset: Band::secs(10.0, 20.0),
            reset_step: Duration::from_secs(5),
        }
    }

    /// Wait before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32, connection_reset: bool, rng: &mut impl Rng) -> Duration {
        let prior = attempt.saturating_sub(1);
        if connection_reset {
            return self.reset.sample(rng) + self.reset_step * prior;
        }

        let exponential = self
            .base
            .checked_mul(2u32.saturating_pow(prior))
            .unwrap_or(self.cap);
        (exponential + self.jitter.sample(rng)).min(self.cap)
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Owns every pause the crawler takes.
pub struct Waiter {
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    rate: Option<f64>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Waiter {
    pub fn new(clock: Arc<dyn Clock>, cancel: CancelToken, rate: Option<f64>) -> Self {
        Self {
            clock,
            cancel,
            rate: rate.filter(|rate| *rate > 0.0),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Sleeps for a random duration within `band`.
    pub fn pause(&self, band: Band) -> crate::Result<()> {
        let duration = band.sample(&mut rand::rng());
        self.sleep(duration)
    }

    pub fn sleep(&self, duration: Duration) -> crate::Result<()> {
        let deadline = self.clock.now() + duration;
        loop {
            self.cancel.check()?;
            let now = self.clock.now();
            if now >= deadline {
                return Ok(());
            }
            self.clock.sleep((deadline - now).min(SLICE));
        }
    }

    /// Blocks until the bucket for `host` holds a token.
    pub fn throttle(&self, host: &str) -> crate::Result<()> {
        let rate = match self.rate {
            Some(rate) => rate,
            None => return Ok(()),
        };
        let capacity = rate.ceil().max(1.0);

        loop {
            let wait = {
                let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
                let now = self.clock.now();
                let bucket = buckets.entry(host.to_string()).or_insert(TokenBucket {
                    tokens: capacity,
                    last_refill: now,
                });

                let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }

                Duration::from_secs_f64(((1.0 - bucket.tokens) / rate).max(0.001))
            };

            self.sleep(wait)?;
        }
    }
}
