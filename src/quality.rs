//! Connection quality derived from heartbeat round-trip times.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

const EXCELLENT_BELOW: Duration = Duration::from_millis(150);
const GOOD_BELOW: Duration = Duration::from_millis(400);

/// Coarse signal shown by the UI's connection indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Offline,
}

/// Rolling window of heartbeat round-trip samples.
///
/// Quality is derived from the median rather than the mean so a single
/// outlier ping does not flap the indicator.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn median(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    /// Current quality. `connected` comes from the owning connection; a
    /// disconnected transport is always Offline regardless of history.
    pub fn quality(&self, connected: bool) -> ConnectionQuality {
        if !connected {
            return ConnectionQuality::Offline;
        }
        match self.median() {
            // No samples yet on a live connection: assume the best until
            // the first heartbeat says otherwise.
            None => ConnectionQuality::Excellent,
            Some(m) if m < EXCELLENT_BELOW => ConnectionQuality::Excellent,
            Some(m) if m < GOOD_BELOW => ConnectionQuality::Good,
            Some(_) => ConnectionQuality::Poor,
        }
    }
}
