use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::domain::{BatteryId, BatteryLimits, FlowDirection};
use crate::error::ControlError;
use crate::hardware::HardwareMode;
use crate::telemetry::LogFormat;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "ARBITER_CONFIG";
pub const ENV_PREFIX: &str = "ARBITER__";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    pub hardware: HardwareMode,
    pub log_format: LogFormat,
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub grid: GridConfig,
    #[validate(nested)]
    pub batteries: BatteriesConfig,
    #[validate(nested)]
    pub levels: LevelsConfig,
    #[validate(nested)]
    pub pid: PidConfig,
    #[validate(nested)]
    pub wallbox: WallboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub tick_seconds: u64,
    /// Upper bound on input acquisition per tick
    #[validate(range(min = 1))]
    pub tick_timeout_seconds: u64,
    /// Readings older than this are stale; 0 disables the age check
    pub stale_after_seconds: u64,
    /// Command cache TTL; 0 suppresses identical writes until the value changes
    pub command_cache_seconds: u64,
    pub priority_interval_minutes: u64,
    /// Minimum spacing of re-rankings not caused by a direction change
    pub priority_min_refresh_seconds: u64,
    pub ct_mode: bool,
    #[validate(range(min = 1))]
    pub ct_tick_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 2,
            tick_timeout_seconds: 10,
            stale_after_seconds: 300,
            command_cache_seconds: 30,
            priority_interval_minutes: 15,
            priority_min_refresh_seconds: 10,
            ct_mode: false,
            ct_tick_seconds: 10,
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }

    pub fn ct_tick_interval(&self) -> Duration {
        Duration::from_secs(self.ct_tick_seconds.max(1))
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GridConfig {
    #[validate(length(min = 1))]
    pub sensor: String,
    /// Optional PV production sensor; caps charge power at production
    pub pv_sensor: Option<String>,
    /// 0 passes the latest sample through
    pub smoothing_seconds: u64,
    #[validate(range(min = 0.0))]
    pub min_surplus_w: f64,
    #[validate(range(min = 0.0))]
    pub min_import_w: f64,
    #[validate(range(min = 1))]
    pub below_min_cycles_to_zero: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            sensor: "sensor.grid_power".to_string(),
            pv_sensor: None,
            smoothing_seconds: 5,
            min_surplus_w: 50.0,
            min_import_w: 50.0,
            below_min_cycles_to_zero: 1,
        }
    }
}

impl GridConfig {
    /// Dispatch floor for a direction
    pub fn min_power_w(&self, direction: FlowDirection) -> f64 {
        match direction {
            FlowDirection::Charging => self.min_surplus_w,
            FlowDirection::Discharging => self.min_import_w,
            FlowDirection::Idle => f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatteriesConfig {
    /// Base names for slots 1-3; empty or "0" disables a slot
    pub unit_1: String,
    pub unit_2: String,
    pub unit_3: String,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percent: f64,
    #[validate(range(min = 0.0))]
    pub max_charge_power_w: f64,
    #[validate(range(min = 0.0))]
    pub max_discharge_power_w: f64,
    #[validate(range(min = 1.0))]
    pub capacity_wh: f64,
    /// Write the force-mode select and control switch along with power numbers
    pub explicit_mode_control: bool,
}

impl Default for BatteriesConfig {
    fn default() -> Self {
        let limits = BatteryLimits::default();
        Self {
            unit_1: String::new(),
            unit_2: String::new(),
            unit_3: String::new(),
            min_soc_percent: limits.min_soc_percent,
            max_soc_percent: limits.max_soc_percent,
            max_charge_power_w: limits.max_charge_w,
            max_discharge_power_w: limits.max_discharge_w,
            capacity_wh: limits.capacity_wh,
            explicit_mode_control: true,
        }
    }
}

impl BatteriesConfig {
    /// Enabled slots in slot order
    pub fn slots(&self) -> Vec<(BatteryId, String)> {
        [&self.unit_1, &self.unit_2, &self.unit_3]
            .into_iter()
            .enumerate()
            .filter_map(|(idx, name)| {
                let name = name.trim();
                if name.is_empty() || name == "0" {
                    None
                } else {
                    Some((BatteryId(idx as u8 + 1), name.to_string()))
                }
            })
            .collect()
    }

    pub fn limits(&self) -> BatteryLimits {
        BatteryLimits {
            min_soc_percent: self.min_soc_percent,
            max_soc_percent: self.max_soc_percent,
            max_charge_w: self.max_charge_power_w,
            max_discharge_w: self.max_discharge_power_w,
            capacity_wh: self.capacity_wh,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LevelThresholds {
    #[validate(range(min = 0.0))]
    pub level1_w: f64,
    #[validate(range(min = 0.0))]
    pub level2_w: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            level1_w: 1800.0,
            level2_w: 3600.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LevelsConfig {
    #[validate(nested)]
    pub charge: LevelThresholds,
    #[validate(nested)]
    pub discharge: LevelThresholds,
    #[validate(range(min = 0.0))]
    pub offset_w: f64,
}

impl Default for LevelsConfig {
    fn default() -> Self {
        Self {
            charge: LevelThresholds::default(),
            discharge: LevelThresholds::default(),
            offset_w: 50.0,
        }
    }
}

impl LevelsConfig {
    pub fn thresholds(&self, direction: FlowDirection) -> &LevelThresholds {
        match direction {
            FlowDirection::Discharging => &self.discharge,
            _ => &self.charge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PidConfig {
    pub enabled: bool,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kp: 0.6,
            ki: 0.02,
            kd: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WallboxConfig {
    pub power_sensor: Option<String>,
    pub cable_sensor: Option<String>,
    /// Surplus above which home charging pauses in favour of the car
    #[validate(range(min = 0.0))]
    pub max_surplus_w: f64,
    /// Wallbox power above this counts as "car drawing"
    #[validate(range(min = 0.0))]
    pub active_threshold_w: f64,
    #[validate(range(min = 0.0))]
    pub fluctuation_tolerance_w: f64,
    pub stagnation_seconds: u64,
    /// Bounded start-up window and the maximum pause without the car drawing
    pub start_delay_seconds: u64,
    /// Spacing of retry windows; 0 disables them
    pub retry_minutes: u64,
}

impl Default for WallboxConfig {
    fn default() -> Self {
        Self {
            power_sensor: None,
            cable_sensor: None,
            max_surplus_w: 1500.0,
            active_threshold_w: 100.0,
            fluctuation_tolerance_w: 200.0,
            stagnation_seconds: 60,
            start_delay_seconds: 120,
            retry_minutes: 60,
        }
    }
}

impl WallboxConfig {
    pub fn is_configured(&self) -> bool {
        let set = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.trim().is_empty());
        set(&self.power_sensor) && set(&self.cable_sensor)
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry_minutes > 0 && self.start_delay_seconds > 0
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_path(&path)
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        cfg.check_consistency()?;
        Ok(cfg)
    }

    /// Cross-field rules that make the configuration unusable at startup
    pub fn check_consistency(&self) -> Result<(), ControlError> {
        if self.batteries.slots().is_empty() {
            return Err(ControlError::Configuration(
                "at least one battery slot must be configured".into(),
            ));
        }
        if self.batteries.min_soc_percent >= self.batteries.max_soc_percent {
            return Err(ControlError::Configuration(format!(
                "min_soc_percent ({}) must be below max_soc_percent ({})",
                self.batteries.min_soc_percent, self.batteries.max_soc_percent
            )));
        }
        for (label, t) in [("charge", &self.levels.charge), ("discharge", &self.levels.discharge)] {
            if t.level1_w >= t.level2_w {
                return Err(ControlError::Configuration(format!(
                    "{label} level1_w ({}) must be below level2_w ({})",
                    t.level1_w, t.level2_w
                )));
            }
        }
        Ok(())
    }
}
