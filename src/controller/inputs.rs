use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::{BatteryId, BatteryLimits, BatteryUnit, GridSample};
use crate::error::{ControlError, PointError};
use crate::hardware::{BatteryPoints, PointIo, PointValue};

/// One configured battery slot and its point identifiers
#[derive(Debug, Clone)]
pub struct BatterySlot {
    pub id: BatteryId,
    pub name: String,
    pub points: BatteryPoints,
}

/// Raw wallbox signals
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallboxReading {
    pub plugged: bool,
    pub power_w: f64,
}

/// Everything read from the site for one tick
#[derive(Debug, Clone)]
pub struct TickInputs {
    pub now: DateTime<Utc>,
    pub grid: GridSample,
    pub pv_power_w: Option<f64>,
    pub units: Vec<BatteryUnit>,
    /// `None` when the wallbox is unconfigured or its inputs were stale
    pub wallbox: Option<WallboxReading>,
}

impl TickInputs {
    pub fn stale_units(&self) -> Vec<BatteryId> {
        self.units
            .iter()
            .filter(|u| !u.available)
            .map(|u| u.id)
            .collect()
    }
}

/// Reads and validates the site's points
#[derive(Debug, Clone)]
pub struct InputReader {
    grid_sensor: String,
    pv_sensor: Option<String>,
    wallbox_power: Option<String>,
    wallbox_cable: Option<String>,
    slots: Vec<BatterySlot>,
    limits: BatteryLimits,
    stale_after: Option<Duration>,
}

impl InputReader {
    pub fn from_config(cfg: &Config) -> Self {
        let (wallbox_power, wallbox_cable) = if cfg.wallbox.is_configured() {
            (
                cfg.wallbox.power_sensor.clone(),
                cfg.wallbox.cable_sensor.clone(),
            )
        } else {
            (None, None)
        };
        let stale_after = match cfg.controller.stale_after_seconds {
            0 => None,
            s => Some(Duration::seconds(s as i64)),
        };
        Self {
            grid_sensor: cfg.grid.sensor.clone(),
            pv_sensor: cfg.grid.pv_sensor.clone().filter(|s| !s.trim().is_empty()),
            wallbox_power,
            wallbox_cable,
            slots: cfg
                .batteries
                .slots()
                .into_iter()
                .map(|(id, name)| BatterySlot {
                    id,
                    points: BatteryPoints::for_base(&name),
                    name,
                })
                .collect(),
            limits: cfg.batteries.limits(),
            stale_after,
        }
    }

    pub fn slots(&self) -> &[BatterySlot] {
        &self.slots
    }

    fn fresh<T>(
        &self,
        point: &str,
        read: Result<PointValue<T>, PointError>,
        now: DateTime<Utc>,
    ) -> Result<T, ControlError> {
        let reading = read?;
        if let Some(limit) = self.stale_after {
            let age = now - reading.observed_at;
            if age > limit {
                return Err(ControlError::stale(
                    point,
                    format!("last update {}s ago", age.num_seconds()),
                ));
            }
        }
        Ok(reading.value)
    }

    fn finite(&self, point: &str, value: f64) -> Result<f64, ControlError> {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ControlError::stale(point, format!("non-finite value {value}")))
        }
    }

    fn numeric(
        &self,
        point: &str,
        read: Result<PointValue<f64>, PointError>,
        now: DateTime<Utc>,
    ) -> Result<f64, ControlError> {
        self.fresh(point, read, now)
            .and_then(|v| self.finite(point, v))
    }

    /// Reads all inputs. Only a missing grid reading fails the tick; other
    /// gaps degrade the affected unit or subsystem.
    pub async fn acquire(
        &self,
        io: &dyn PointIo,
        now: DateTime<Utc>,
    ) -> Result<TickInputs, ControlError> {
        let grid_power_w = self.numeric(
            &self.grid_sensor,
            io.read_numeric(&self.grid_sensor).await,
            now,
        )?;

        let units = join_all(self.slots.iter().map(|slot| self.read_battery(io, slot, now))).await;

        let pv_power_w = match &self.pv_sensor {
            Some(point) => match self.numeric(point, io.read_numeric(point).await, now) {
                Ok(v) => Some(v.max(0.0)),
                Err(err) => {
                    debug!(error = %err, "pv reading unavailable, charge not capped");
                    None
                }
            },
            None => None,
        };

        let wallbox = self.read_wallbox(io, now).await;

        Ok(TickInputs {
            now,
            grid: GridSample::new(now, grid_power_w),
            pv_power_w,
            units,
            wallbox,
        })
    }

    async fn read_battery(&self, io: &dyn PointIo, slot: &BatterySlot, now: DateTime<Utc>) -> BatteryUnit {
        let (soc, ac) = futures::join!(
            io.read_numeric(&slot.points.soc),
            io.read_numeric(&slot.points.ac_power)
        );
        let mut unit = BatteryUnit::new(slot.id, slot.name.clone(), self.limits);

        let soc = self.numeric(&slot.points.soc, soc, now);
        let ac = self.numeric(&slot.points.ac_power, ac, now);
        match (soc, ac) {
            (Ok(soc), Ok(ac)) => {
                unit.soc_percent = soc;
                unit.ac_power_w = ac;
                unit.available = true;
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(battery = %slot.id, name = %slot.name, error = %err, "battery excluded this tick");
            }
        }
        unit
    }

    async fn read_wallbox(&self, io: &dyn PointIo, now: DateTime<Utc>) -> Option<WallboxReading> {
        let (power_point, cable_point) = match (&self.wallbox_power, &self.wallbox_cable) {
            (Some(p), Some(c)) => (p, c),
            _ => return None,
        };
        let (power, cable) = futures::join!(io.read_numeric(power_point), io.read_bool(cable_point));
        let power = self.numeric(power_point, power, now);
        let cable = self.fresh(cable_point, cable, now);
        match (power, cable) {
            (Ok(power_w), Ok(plugged)) => Some(WallboxReading {
                plugged,
                power_w: power_w.max(0.0),
            }),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "wallbox inputs stale");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MemoryPoints;

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.batteries.unit_1 = "venus_a".into();
        cfg.batteries.unit_2 = "venus_b".into();
        cfg.wallbox.power_sensor = Some("sensor.wallbox_power".into());
        cfg.wallbox.cable_sensor = Some("binary_sensor.wallbox_cable".into());
        cfg
    }

    fn seeded(now: DateTime<Utc>) -> MemoryPoints {
        let io = MemoryPoints::new();
        io.set_numeric_at("sensor.grid_power", 320.0, now);
        for base in ["venus_a", "venus_b"] {
            let p = BatteryPoints::for_base(base);
            io.set_numeric_at(&p.soc, 55.0, now);
            io.set_numeric_at(&p.ac_power, 0.0, now);
        }
        io.set_numeric_at("sensor.wallbox_power", 0.0, now);
        io.set_bool_at("binary_sensor.wallbox_cable", true, now);
        io
    }

    #[tokio::test]
    async fn test_acquire_reads_all_points() {
        let now = Utc::now();
        let io = seeded(now);
        let inputs = InputReader::from_config(&cfg()).acquire(&io, now).await.unwrap();
        assert_eq!(inputs.grid.power_w, 320.0);
        assert_eq!(inputs.units.len(), 2);
        assert!(inputs.units.iter().all(|u| u.available));
        assert_eq!(
            inputs.wallbox,
            Some(WallboxReading {
                plugged: true,
                power_w: 0.0
            })
        );
    }

    #[tokio::test]
    async fn test_missing_grid_fails_tick() {
        let now = Utc::now();
        let io = seeded(now);
        io.remove("sensor.grid_power");
        let err = InputReader::from_config(&cfg()).acquire(&io, now).await.unwrap_err();
        assert!(matches!(err, ControlError::StaleInput { .. }));
    }

    #[tokio::test]
    async fn test_non_numeric_soc_marks_unit_unavailable() {
        let now = Utc::now();
        let io = seeded(now);
        io.set_raw("sensor.venus_b_battery_soc", "unknown");
        let inputs = InputReader::from_config(&cfg()).acquire(&io, now).await.unwrap();
        assert_eq!(inputs.stale_units(), vec![BatteryId(2)]);
    }

    #[tokio::test]
    async fn test_old_reading_is_stale() {
        let now = Utc::now();
        let io = seeded(now);
        io.set_numeric_at("sensor.venus_a_ac_power", 0.0, now - Duration::seconds(301));
        io.set_bool_at("binary_sensor.wallbox_cable", true, now - Duration::minutes(10));
        let inputs = InputReader::from_config(&cfg()).acquire(&io, now).await.unwrap();
        assert_eq!(inputs.stale_units(), vec![BatteryId(1)]);
        assert_eq!(inputs.wallbox, None);
    }

    #[tokio::test]
    async fn test_zero_stale_bound_disables_age_check() {
        let now = Utc::now();
        let io = seeded(now - Duration::hours(2));
        let mut cfg = cfg();
        cfg.controller.stale_after_seconds = 0;
        let inputs = InputReader::from_config(&cfg).acquire(&io, now).await.unwrap();
        assert!(inputs.stale_units().is_empty());
    }
}
