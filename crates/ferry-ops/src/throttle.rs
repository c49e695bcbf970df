//! Sleep-based pacing of transfer throughput.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Longest single sleep before the cancellation token is checked again.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Paces a byte stream to a rate that may change while it runs.
///
/// The pacer measures from the moment the current rate took effect, so a
/// rate change mid-transfer neither punishes nor rewards the bytes that were
/// moved under the previous rate.
#[derive(Debug)]
pub struct Pacer {
    rate: u64,
    since: Instant,
    base: u64,
}

impl Pacer {
    /// Create an unthrottled pacer.
    pub fn new() -> Self {
        Self {
            rate: 0,
            since: Instant::now(),
            base: 0,
        }
    }

    /// Create a pacer whose clock starts now under `rate`.
    pub fn with_rate(rate: u64) -> Self {
        Self {
            rate,
            since: Instant::now(),
            base: 0,
        }
    }

    /// How long to wait after `copied` total bytes to honor `rate` bytes/s.
    ///
    /// A rate of 0 means unlimited.
    pub fn delay(&mut self, copied: u64, rate: u64) -> Duration {
        if rate != self.rate {
            self.rate = rate;
            self.since = Instant::now();
            self.base = copied;
            return Duration::ZERO;
        }
        if rate == 0 {
            return Duration::ZERO;
        }

        let due = Duration::from_secs_f64(copied.saturating_sub(self.base) as f64 / rate as f64);
        due.saturating_sub(self.since.elapsed())
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk size to use under `rate`, so slow limits still produce one chunk
/// per second rather than one burst per chunk.
pub fn chunk_size_for(rate: u64, chunk_size: usize) -> usize {
    if rate == 0 {
        chunk_size
    } else {
        chunk_size.min(usize::try_from(rate).unwrap_or(usize::MAX)).max(1)
    }
}

/// Block the current thread for `duration` unless `token` fires first.
///
/// Returns `false` if the sleep was cut short by cancellation.
pub fn sleep_unless_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let mut pacer = Pacer::new();
        assert_eq!(pacer.delay(1_000_000, 0), Duration::ZERO);
    }

    #[test]
    fn test_delay_tracks_rate() {
        let mut pacer = Pacer::new();
        // First call under a new rate starts the clock.
        assert_eq!(pacer.delay(0, 100), Duration::ZERO);
        let delay = pacer.delay(100, 100);
        assert!(delay > Duration::from_millis(900), "{delay:?}");
        assert!(delay <= Duration::from_secs(1));
    }

    #[test]
    fn test_primed_pacer_counts_first_chunk() {
        let mut pacer = Pacer::with_rate(50);
        let delay = pacer.delay(50, 50);
        assert!(delay > Duration::from_millis(900), "{delay:?}");
    }

    #[test]
    fn test_rate_change_restarts_clock() {
        let mut pacer = Pacer::new();
        pacer.delay(0, 10);
        assert_eq!(pacer.delay(500, 1000), Duration::ZERO);
        let delay = pacer.delay(1500, 1000);
        assert!(delay > Duration::from_millis(900), "{delay:?}");
    }

    #[test]
    fn test_chunk_size_for() {
        assert_eq!(chunk_size_for(0, 65536), 65536);
        assert_eq!(chunk_size_for(50, 65536), 50);
        assert_eq!(chunk_size_for(1 << 30, 65536), 65536);
    }

    #[test]
    fn test_sleep_cut_short() {
        let token = CancellationToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(!sleep_unless_cancelled(Duration::from_secs(5), &token));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
