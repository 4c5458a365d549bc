//! Network-adjusted time.
//!
//! Outbound peers report their clock in VERSION. One sample is kept per
//! address; the median offset becomes the adjustment once enough samples
//! arrived, provided it stays within a sane bound.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::{info, warn};

/// Samples needed before the median is used.
pub const MIN_TIME_SAMPLES: usize = 5;

/// Samples retained.
pub const MAX_TIME_SAMPLES: usize = 200;

/// Largest adjustment applied, in seconds.
pub const MAX_TIME_ADJUSTMENT: i64 = 70 * 60;

#[derive(Default)]
struct TimeDataInner {
    sources: HashSet<IpAddr>,
    samples: Vec<i64>,
    offset: i64,
    warned: bool,
}

#[derive(Default)]
pub struct TimeData {
    inner: Mutex<TimeDataInner>,
}

impl TimeData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `offset` seconds reported by `source`. Repeat sources are ignored.
    pub fn add_sample(&self, source: IpAddr, offset: i64) {
        let mut inner = self.inner.lock();
        if inner.samples.len() >= MAX_TIME_SAMPLES || !inner.sources.insert(source) {
            return;
        }
        inner.samples.push(offset);

        let count = inner.samples.len();
        // Recompute on odd counts only so the median is a real sample.
        if count < MIN_TIME_SAMPLES || count % 2 == 0 {
            return;
        }
        let mut sorted = inner.samples.clone();
        sorted.sort_unstable();
        let median = sorted[count / 2];

        if median.abs() <= MAX_TIME_ADJUSTMENT {
            inner.offset = median;
            info!(offset = median, samples = count, "Network time offset updated");
        } else {
            inner.offset = 0;
            if !inner.warned {
                inner.warned = true;
                warn!(
                    median,
                    "Peers disagree with the local clock; check the system time"
                );
            }
        }
    }

    /// Current adjustment in seconds.
    pub fn offset(&self) -> i64 {
        self.inner.lock().offset
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }
}
