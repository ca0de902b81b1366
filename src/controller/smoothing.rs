use chrono::Duration;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

use crate::domain::GridSample;

/// Hard bound on buffered samples regardless of window length
const MAX_SAMPLES: usize = 3600;

/// Smoothed control input together with the window it was computed over
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SmoothedSignal {
    pub value: f64,
    pub window_seconds: u64,
}

/// Moving average of grid power over a trailing time window
///
/// With a zero window the latest sample is passed through unbuffered.
#[derive(Debug, Clone)]
pub struct SignalSmoother {
    window_seconds: u64,
    samples: VecDeque<GridSample>,
    latest: Option<GridSample>,
}

impl SignalSmoother {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window_seconds,
            samples: VecDeque::new(),
            latest: None,
        }
    }

    pub fn observe(&mut self, sample: GridSample) {
        if let Some(latest) = self.latest {
            if sample.timestamp < latest.timestamp {
                debug!(
                    sample_at = %sample.timestamp,
                    latest_at = %latest.timestamp,
                    "dropping out-of-order grid sample"
                );
                return;
            }
        }
        self.latest = Some(sample);
        if self.window_seconds == 0 {
            return;
        }

        self.samples.push_back(sample);
        let window = Duration::seconds(self.window_seconds as i64);
        while let Some(front) = self.samples.front() {
            if sample.timestamp - front.timestamp >= window || self.samples.len() > MAX_SAMPLES {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn value(&self) -> f64 {
        if self.window_seconds == 0 {
            return self.latest.map_or(0.0, |s| s.power_w);
        }
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.power_w).sum::<f64>() / self.samples.len() as f64
    }

    pub fn signal(&self) -> SmoothedSignal {
        SmoothedSignal {
            value: self.value(),
            window_seconds: self.window_seconds,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_none()
    }
}
