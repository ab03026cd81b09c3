use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const MAX_SAMPLES: usize = 100;

/// Measures throughput of a single transfer.
///
/// Keeps a sliding window of recent samples for the current rate and a
/// running total for the average over the whole transfer.
pub struct TransferMeter {
    started: Instant,
    total: u64,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl Default for TransferMeter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl TransferMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            started: Instant::now(),
            total: 0,
            window,
            samples: VecDeque::new(),
        }
    }

    /// Records `bytes` transferred just now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        self.samples.push_back((now, bytes));

        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > self.window || self.samples.len() > MAX_SAMPLES {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes recorded since the meter was created.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Rate over the sliding window in bytes/second; 0.0 with fewer than 2 samples.
    pub fn current_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.0.duration_since(first.0);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Average rate since creation in bytes/second.
    pub fn average_rate(&self) -> f64 {
        let elapsed = self.started.elapsed();
        if elapsed.is_zero() {
            return 0.0;
        }
        self.total as f64 / elapsed.as_secs_f64()
    }
}
