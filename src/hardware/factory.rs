use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{BatteryPoints, MemoryPoints, PointIo};
use crate::config::Config;

/// Hardware mode configuration
///
/// Real hosts plug in their own [`PointIo`]; the binary ships with a simulated
/// site and a static mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareMode {
    /// Simulated house, PV, batteries and wallbox
    #[cfg(feature = "sim")]
    Simulated,
    /// Static readings that never go stale, writes are only recorded
    Mock,
}

impl Default for HardwareMode {
    fn default() -> Self {
        #[cfg(feature = "sim")]
        {
            HardwareMode::Simulated
        }
        #[cfg(not(feature = "sim"))]
        {
            HardwareMode::Mock
        }
    }
}

/// A constructed site: the capability handle plus the concrete backend
pub enum Site {
    #[cfg(feature = "sim")]
    Simulated(Arc<super::simulated::SimulatedSite>),
    Mock(Arc<MemoryPoints>),
}

impl Site {
    pub fn io(&self) -> Arc<dyn PointIo> {
        match self {
            #[cfg(feature = "sim")]
            Site::Simulated(site) => site.clone(),
            Site::Mock(points) => points.clone(),
        }
    }
}

/// Factory for creating the point backend
pub struct PointIoFactory {
    mode: HardwareMode,
}

impl PointIoFactory {
    pub fn new(mode: HardwareMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> HardwareMode {
        self.mode
    }

    pub fn create(&self, cfg: &Config) -> Site {
        match self.mode {
            #[cfg(feature = "sim")]
            HardwareMode::Simulated => Site::Simulated(Arc::new(
                super::simulated::SimulatedSite::new(cfg, Default::default()),
            )),
            HardwareMode::Mock => Site::Mock(Arc::new(Self::seeded_mock(cfg))),
        }
    }

    /// Mock with a balanced grid and half-full batteries
    fn seeded_mock(cfg: &Config) -> MemoryPoints {
        let points = MemoryPoints::live();
        points.set_numeric(&cfg.grid.sensor, 0.0);
        for (_, name) in cfg.batteries.slots() {
            let p = BatteryPoints::for_base(&name);
            points.set_numeric(&p.soc, 50.0);
            points.set_numeric(&p.ac_power, 0.0);
        }
        if let Some(sensor) = &cfg.wallbox.power_sensor {
            points.set_numeric(sensor, 0.0);
        }
        if let Some(sensor) = &cfg.wallbox.cable_sensor {
            points.set_bool(sensor, false);
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_mock_site_is_seeded_for_configured_slots() {
        let mut cfg = Config::default();
        cfg.batteries.unit_1 = "venus_a".into();
        let site = PointIoFactory::new(HardwareMode::Mock).create(&cfg);
        let io = site.io();

        let soc = io.read_numeric("sensor.venus_a_battery_soc").await.unwrap();
        assert_eq!(soc.value, 50.0);
        assert!(io.read_numeric("sensor.venus_b_battery_soc").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_site_readings_never_go_stale() {
        let mut cfg = Config::default();
        cfg.batteries.unit_1 = "venus_a".into();
        let site = PointIoFactory::new(HardwareMode::Mock).create(&cfg);
        let io = site.io();

        let before = Utc::now();
        let grid = io.read_numeric(&cfg.grid.sensor).await.unwrap();
        assert!(grid.observed_at >= before);
    }

    #[cfg(feature = "sim")]
    #[test]
    fn test_default_mode_is_simulated() {
        assert_eq!(HardwareMode::default(), HardwareMode::Simulated);
    }
}
