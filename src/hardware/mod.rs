//! Capability surface towards the host automation platform.
//!
//! The control core only ever reads named numeric/boolean points and writes
//! named points. Everything behind that surface (entity discovery, transport,
//! unit conversion) belongs to the host adapter implementing [`PointIo`].

pub mod factory;
pub mod memory;
pub mod points;
#[cfg(feature = "sim")]
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PointError;

pub use factory::{HardwareMode, PointIoFactory};
pub use memory::MemoryPoints;
pub use points::{BatteryPoints, ForceMode};

/// A value read from a point together with the time the host last confirmed it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointValue<T> {
    pub value: T,
    pub observed_at: DateTime<Utc>,
}

impl<T> PointValue<T> {
    pub fn new(value: T, observed_at: DateTime<Utc>) -> Self {
        Self { value, observed_at }
    }
}

/// Value written to a control point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    Number(f64),
    Option(String),
    Switch(bool),
}

impl fmt::Display for CommandValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandValue::Number(v) => write!(f, "{v}"),
            CommandValue::Option(v) => write!(f, "{v}"),
            CommandValue::Switch(true) => write!(f, "on"),
            CommandValue::Switch(false) => write!(f, "off"),
        }
    }
}

/// Read/write capability the host provides
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PointIo: Send + Sync {
    async fn read_numeric(&self, point: &str) -> Result<PointValue<f64>, PointError>;
    async fn read_bool(&self, point: &str) -> Result<PointValue<bool>, PointError>;
    async fn write(&self, point: &str, value: &CommandValue) -> Result<(), PointError>;
}
