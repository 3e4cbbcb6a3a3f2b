//! Event rate meters.
//!
//! A [`RateMeter`] counts events and reports a one-minute exponentially
//! weighted moving average, ticked every five seconds, plus the mean rate
//! since creation.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const WINDOW_SECS: f64 = 60.0;

#[derive(Debug)]
struct Ewma {
    rate: f64,
    initialized: bool,
    last_tick: Instant,
}

/// Thread-safe event meter.
#[derive(Debug)]
pub struct RateMeter {
    count: AtomicU64,
    uncounted: AtomicU64,
    ewma: Mutex<Ewma>,
    start: Instant,
}

impl RateMeter {
    /// Create a meter starting now.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(start: Instant) -> Self {
        Self {
            count: AtomicU64::new(0),
            uncounted: AtomicU64::new(0),
            ewma: Mutex::new(Ewma {
                rate: 0.0,
                initialized: false,
                last_tick: start,
            }),
            start,
        }
    }

    /// Record `n` events.
    pub fn mark(&self, n: u64) {
        self.tick_at(Instant::now());
        self.count.fetch_add(n, Ordering::Relaxed);
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Total events recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// One-minute moving rate in events per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.tick_at(Instant::now());
        self.ewma
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .rate
    }

    /// Mean rate since creation in events per second.
    #[must_use]
    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.count() as f64 / elapsed
    }

    fn tick_at(&self, now: Instant) {
        let mut ewma = self
            .ewma
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let ticks = now.saturating_duration_since(ewma.last_tick).as_secs() / TICK_INTERVAL.as_secs();
        if ticks == 0 {
            return;
        }

        let interval = TICK_INTERVAL.as_secs_f64();
        let alpha = 1.0 - (-interval / WINDOW_SECS).exp();
        for _ in 0..ticks {
            let instant_rate = self.uncounted.swap(0, Ordering::Relaxed) as f64 / interval;
            if ewma.initialized {
                ewma.rate += alpha * (instant_rate - ewma.rate);
            } else {
                ewma.rate = instant_rate;
                ewma.initialized = true;
            }
        }
        ewma.last_tick += TICK_INTERVAL * ticks as u32;
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}
