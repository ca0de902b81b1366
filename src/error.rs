use thiserror::Error;

/// Failures at the read/write capability boundary
#[derive(Debug, Error)]
pub enum PointError {
    #[error("point '{0}' is unavailable")]
    Unavailable(String),
    #[error("point '{point}' has a non-numeric value '{raw}'")]
    NotNumeric { point: String, raw: String },
    #[error("transport error on '{point}': {message}")]
    Transport { point: String, message: String },
}

impl PointError {
    pub fn point(&self) -> &str {
        match self {
            PointError::Unavailable(point) => point,
            PointError::NotNumeric { point, .. } => point,
            PointError::Transport { point, .. } => point,
        }
    }
}

/// Control-core error taxonomy
///
/// Only `Configuration` is fatal, and only at startup. `StaleInput` degrades
/// eligibility for one tick. `WriteFailure` and `Timeout` are logged and the
/// next tick recomputes the command from scratch.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("stale input on '{point}': {reason}")]
    StaleInput { point: String, reason: String },
    #[error("write to '{point}' failed")]
    WriteFailure {
        point: String,
        #[source]
        source: PointError,
    },
    #[error("{operation} did not complete within {after_s}s")]
    Timeout { operation: String, after_s: u64 },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ControlError {
    pub fn stale(point: impl Into<String>, reason: impl Into<String>) -> Self {
        ControlError::StaleInput {
            point: point.into(),
            reason: reason.into(),
        }
    }
}

impl From<PointError> for ControlError {
    fn from(err: PointError) -> Self {
        let point = err.point().to_string();
        ControlError::StaleInput {
            point,
            reason: err.to_string(),
        }
    }
}
