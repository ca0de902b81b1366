use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::{CommandValue, PointIo, PointValue};
use crate::error::PointError;

#[derive(Debug, Default)]
struct Inner {
    numeric: HashMap<String, PointValue<f64>>,
    boolean: HashMap<String, PointValue<bool>>,
    raw: HashMap<String, String>,
    written: HashMap<String, CommandValue>,
    write_log: Vec<(String, CommandValue)>,
    failing: HashSet<String>,
}

/// In-memory point store with pre-programmed readings and a write log
///
/// Used by tests and as the `Mock` hardware mode.
#[derive(Debug, Default)]
pub struct MemoryPoints {
    inner: Mutex<Inner>,
    live: bool,
}

impl MemoryPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readings are stamped at read time, like a host that keeps
    /// republishing unchanged states
    pub fn live() -> Self {
        Self {
            live: true,
            ..Self::default()
        }
    }

    fn stamped<T: Copy>(&self, value: PointValue<T>) -> PointValue<T> {
        if self.live {
            PointValue::new(value.value, Utc::now())
        } else {
            value
        }
    }

    pub fn set_numeric(&self, point: &str, value: f64) {
        self.set_numeric_at(point, value, Utc::now());
    }

    pub fn set_numeric_at(&self, point: &str, value: f64, observed_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.raw.remove(point);
        inner
            .numeric
            .insert(point.to_string(), PointValue::new(value, observed_at));
    }

    pub fn set_bool(&self, point: &str, value: bool) {
        self.set_bool_at(point, value, Utc::now());
    }

    pub fn set_bool_at(&self, point: &str, value: bool, observed_at: DateTime<Utc>) {
        self.inner
            .lock()
            .boolean
            .insert(point.to_string(), PointValue::new(value, observed_at));
    }

    /// Store a raw state that cannot be parsed as a number (e.g. "unknown")
    pub fn set_raw(&self, point: &str, raw: &str) {
        let mut inner = self.inner.lock();
        inner.numeric.remove(point);
        inner.raw.insert(point.to_string(), raw.to_string());
    }

    pub fn remove(&self, point: &str) {
        let mut inner = self.inner.lock();
        inner.numeric.remove(point);
        inner.boolean.remove(point);
        inner.raw.remove(point);
    }

    /// Make every write to `point` fail until cleared
    pub fn fail_writes_to(&self, point: &str, fail: bool) {
        let mut inner = self.inner.lock();
        if fail {
            inner.failing.insert(point.to_string());
        } else {
            inner.failing.remove(point);
        }
    }

    pub fn last_written(&self, point: &str) -> Option<CommandValue> {
        self.inner.lock().written.get(point).cloned()
    }

    pub fn last_number(&self, point: &str) -> Option<f64> {
        match self.last_written(point)? {
            CommandValue::Number(v) => Some(v),
            _ => None,
        }
    }

    pub fn write_log(&self) -> Vec<(String, CommandValue)> {
        self.inner.lock().write_log.clone()
    }

    pub fn writes_to(&self, point: &str) -> usize {
        self.inner
            .lock()
            .write_log
            .iter()
            .filter(|(p, _)| p == point)
            .count()
    }
}

#[async_trait]
impl PointIo for MemoryPoints {
    async fn read_numeric(&self, point: &str) -> Result<PointValue<f64>, PointError> {
        let inner = self.inner.lock();
        if let Some(value) = inner.numeric.get(point) {
            return Ok(self.stamped(*value));
        }
        match inner.raw.get(point) {
            Some(raw) => Err(PointError::NotNumeric {
                point: point.to_string(),
                raw: raw.clone(),
            }),
            None => Err(PointError::Unavailable(point.to_string())),
        }
    }

    async fn read_bool(&self, point: &str) -> Result<PointValue<bool>, PointError> {
        self.inner
            .lock()
            .boolean
            .get(point)
            .map(|value| self.stamped(*value))
            .ok_or_else(|| PointError::Unavailable(point.to_string()))
    }

    async fn write(&self, point: &str, value: &CommandValue) -> Result<(), PointError> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(point) {
            return Err(PointError::Transport {
                point: point.to_string(),
                message: "simulated write failure".to_string(),
            });
        }
        inner.written.insert(point.to_string(), value.clone());
        inner.write_log.push((point.to_string(), value.clone()));
        Ok(())
    }
}
