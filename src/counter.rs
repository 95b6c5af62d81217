//! Byte counters and the rate-smoothing machinery used by peer sessions to
//! decide how large a request window to keep open.

use std::time::{Duration, Instant};

/// Smoothing factor for the exponential weighted moving average: the weight
/// given to the newest sample. Chosen per the design notes' call for
/// `alpha ~= 0.2`.
const EWMA_ALPHA: f64 = 0.2;

/// Tracks a monotonically increasing byte count and derives an EWMA-smoothed
/// rate (bytes/sec) from periodic samples of it.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThroughputCounter {
    /// Total bytes transferred since this counter was created.
    total: u64,
    /// Bytes transferred since the last `sample` call.
    since_last_sample: u64,
    /// The current smoothed rate estimate, in bytes/sec.
    rate: Option<f64>,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` additional bytes transferred.
    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.since_last_sample += n;
    }

    /// Returns the total number of bytes ever recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the current smoothed rate without taking a new sample.
    pub fn rate(&self) -> f64 {
        self.rate.unwrap_or(0.0)
    }

    /// Folds the bytes transferred since the last sample into the EWMA,
    /// given how much wall-clock time elapsed. Returns the new rate.
    ///
    /// The first sample initializes the EWMA to the instantaneous rate
    /// rather than blending it with a zero-valued running average, which
    /// would otherwise bias the first several seconds of a connection's
    /// life low.
    pub fn sample(&mut self, elapsed: Duration) -> f64 {
        let elapsed_secs = elapsed.as_secs_f64();
        let instant_rate = if elapsed_secs > 0.0 {
            self.since_last_sample as f64 / elapsed_secs
        } else {
            0.0
        };
        self.since_last_sample = 0;

        let rate = match self.rate {
            Some(prev) => EWMA_ALPHA * instant_rate + (1.0 - EWMA_ALPHA) * prev,
            None => instant_rate,
        };
        self.rate = Some(rate);
        rate
    }
}

/// Periodically samples upload/download counters on a fixed cadence,
/// updating their EWMA rates. Driven by the peer session's rate-meter task.
#[derive(Debug)]
pub(crate) struct RateMeter {
    pub downloaded: ThroughputCounter,
    pub uploaded: ThroughputCounter,
    last_tick: Instant,
}

impl RateMeter {
    pub fn new() -> Self {
        Self {
            downloaded: ThroughputCounter::new(),
            uploaded: ThroughputCounter::new(),
            last_tick: Instant::now(),
        }
    }

    /// Samples both counters using the time elapsed since the last tick.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.downloaded.sample(elapsed);
        self.uploaded.sample(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initializes_rate_to_instantaneous() {
        let mut counter = ThroughputCounter::new();
        counter.add(1000);
        let rate = counter.sample(Duration::from_secs(1));
        assert!((rate - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn subsequent_samples_blend_with_previous() {
        let mut counter = ThroughputCounter::new();
        counter.add(1000);
        let first = counter.sample(Duration::from_secs(1));
        counter.add(0);
        let second = counter.sample(Duration::from_secs(1));
        // EWMA with a zero-rate sample should pull the rate down, but not to
        // zero immediately.
        assert!(second < first);
        assert!(second > 0.0);
    }

    #[test]
    fn total_accumulates_across_samples() {
        let mut counter = ThroughputCounter::new();
        counter.add(100);
        counter.sample(Duration::from_secs(1));
        counter.add(50);
        assert_eq!(counter.total(), 150);
    }
}
