use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Interval between two samples of the transfer counters.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// A change of a transfer rate, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateChange {
    pub previous: f64,
    pub current: f64,
}

impl RateChange {
    pub fn delta(&self) -> f64 {
        self.current - self.previous
    }
}

/// Sliding window over a cumulative byte counter.
#[derive(Debug, Clone)]
pub struct RateHistory {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    rate: f64,
}

impl RateHistory {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            rate: 0.0,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Adds a sample of the counter and reports the rate if it moved.
    pub fn record(&mut self, now: Instant, total: u64) -> Option<RateChange> {
        self.samples.push_back((now, total));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let (first_at, first_total) = *self.samples.front()?;
        let elapsed = now.duration_since(first_at).as_secs_f64();
        let current = if elapsed > 0.0 {
            total.saturating_sub(first_total) as f64 / elapsed
        } else {
            0.0
        };
        if current == self.rate {
            return None;
        }
        let previous = std::mem::replace(&mut self.rate, current);
        Some(RateChange { previous, current })
    }
}
