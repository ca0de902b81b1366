use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reading of the meter at the point of common coupling
///
/// Positive power is import from the grid, negative is export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSample {
    pub timestamp: DateTime<Utc>,
    pub power_w: f64,
}

impl GridSample {
    pub fn new(timestamp: DateTime<Utc>, power_w: f64) -> Self {
        Self { timestamp, power_w }
    }
}
