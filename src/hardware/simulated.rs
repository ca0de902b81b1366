//! # Simulated Site
//!
//! A small house model behind the [`PointIo`] surface: base load with noise,
//! a PV array following the time of day, an optional car on the wallbox and
//! the configured batteries. Batteries follow the force-mode protocol when
//! their control switch is on and self-regulate towards 0 W grid when it is
//! off, which is how the host behaves in CT mode.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{BatteryPoints, CommandValue, ForceMode, PointIo, PointValue};
use crate::config::Config;
use crate::error::PointError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedSiteConfig {
    pub base_load_w: f64,
    pub noise_w: f64,
    pub pv_peak_w: f64,
    pub initial_soc_percent: f64,
    /// Plug state while no schedule is set
    pub car_plugged: bool,
    /// Car is plugged from the first to the second hour (UTC)
    pub car_plug_hours: Option<(u32, u32)>,
    pub car_demand_w: f64,
}

impl Default for SimulatedSiteConfig {
    fn default() -> Self {
        Self {
            base_load_w: 450.0,
            noise_w: 80.0,
            pv_peak_w: 6000.0,
            initial_soc_percent: 50.0,
            car_plugged: false,
            car_plug_hours: Some((17, 22)),
            car_demand_w: 3700.0,
        }
    }
}

#[derive(Debug, Clone)]
struct SimBattery {
    points: BatteryPoints,
    soc_percent: f64,
    capacity_wh: f64,
    max_charge_w: f64,
    max_discharge_w: f64,
    charge_w: f64,
    discharge_w: f64,
    mode: ForceMode,
    control_on: bool,
    /// positive = discharging
    ac_power_w: f64,
}

impl SimBattery {
    fn commanded_ac_power_w(&self) -> f64 {
        match self.mode {
            ForceMode::Charge if self.soc_percent < 100.0 => -self.charge_w.min(self.max_charge_w),
            ForceMode::Discharge if self.soc_percent > 0.0 => {
                self.discharge_w.min(self.max_discharge_w)
            }
            _ => 0.0,
        }
    }
}

#[derive(Debug)]
struct SiteState {
    load_w: f64,
    pv_w: f64,
    wallbox_w: f64,
    plugged: bool,
    batteries: BTreeMap<String, SimBattery>,
    updated_at: DateTime<Utc>,
}

impl SiteState {
    fn battery_sum_w(&self) -> f64 {
        self.batteries.values().map(|b| b.ac_power_w).sum()
    }

    fn grid_w(&self) -> f64 {
        self.load_w + self.wallbox_w - self.pv_w - self.battery_sum_w()
    }
}

pub struct SimulatedSite {
    cfg: SimulatedSiteConfig,
    grid_point: String,
    pv_point: Option<String>,
    wallbox_point: Option<String>,
    cable_point: Option<String>,
    state: Mutex<SiteState>,
}

impl SimulatedSite {
    pub fn new(app: &Config, cfg: SimulatedSiteConfig) -> Self {
        let batteries = app
            .batteries
            .slots()
            .into_iter()
            .map(|(_, name)| {
                let battery = SimBattery {
                    points: BatteryPoints::for_base(&name),
                    soc_percent: cfg.initial_soc_percent,
                    capacity_wh: app.batteries.capacity_wh,
                    max_charge_w: app.batteries.max_charge_power_w,
                    max_discharge_w: app.batteries.max_discharge_power_w,
                    charge_w: 0.0,
                    discharge_w: 0.0,
                    mode: ForceMode::Standby,
                    control_on: true,
                    ac_power_w: 0.0,
                };
                (name, battery)
            })
            .collect();

        let state = SiteState {
            load_w: cfg.base_load_w,
            pv_w: 0.0,
            wallbox_w: 0.0,
            plugged: cfg.car_plugged,
            batteries,
            updated_at: Utc::now(),
        };

        Self {
            grid_point: app.grid.sensor.clone(),
            pv_point: app.grid.pv_sensor.clone(),
            wallbox_point: app.wallbox.power_sensor.clone(),
            cable_point: app.wallbox.cable_sensor.clone(),
            cfg,
            state: Mutex::new(state),
        }
    }

    pub fn pv_at(&self, now: DateTime<Utc>) -> f64 {
        let hour = now.hour() as f64 + now.minute() as f64 / 60.0;
        if !(6.0..=20.0).contains(&hour) {
            return 0.0;
        }
        let phase = std::f64::consts::PI * (hour - 6.0) / 14.0;
        (self.cfg.pv_peak_w * phase.sin()).max(0.0)
    }

    /// Advance the physical model by `dt_s` seconds
    pub fn advance(&self, dt_s: f64, now: DateTime<Utc>) {
        let pv_w = self.pv_at(now);
        let noise = if self.cfg.noise_w > 0.0 {
            rand::thread_rng().gen_range(-self.cfg.noise_w..=self.cfg.noise_w)
        } else {
            0.0
        };

        let mut st = self.state.lock();
        st.pv_w = pv_w;
        st.load_w = (self.cfg.base_load_w + noise).max(0.0);
        if let Some((from, to)) = self.cfg.car_plug_hours {
            st.plugged = (from..to).contains(&now.hour());
        }
        st.wallbox_w = if st.plugged { self.cfg.car_demand_w } else { 0.0 };

        for battery in st.batteries.values_mut() {
            if battery.control_on {
                battery.ac_power_w = battery.commanded_ac_power_w();
            }
        }

        let auto: Vec<String> = st
            .batteries
            .iter()
            .filter(|(_, b)| !b.control_on)
            .map(|(name, _)| name.clone())
            .collect();
        if !auto.is_empty() {
            let controlled_w: f64 = st
                .batteries
                .values()
                .filter(|b| b.control_on)
                .map(|b| b.ac_power_w)
                .sum();
            let residual_w = st.load_w + st.wallbox_w - st.pv_w - controlled_w;
            let share_w = residual_w / auto.len() as f64;
            for name in &auto {
                if let Some(b) = st.batteries.get_mut(name) {
                    b.ac_power_w = if share_w >= 0.0 && b.soc_percent > 0.0 {
                        share_w.min(b.max_discharge_w)
                    } else if share_w < 0.0 && b.soc_percent < 100.0 {
                        share_w.max(-b.max_charge_w)
                    } else {
                        0.0
                    };
                }
            }
        }

        for battery in st.batteries.values_mut() {
            let delta_wh = battery.ac_power_w * dt_s / 3600.0;
            let delta_pct = delta_wh / battery.capacity_wh.max(1.0) * 100.0;
            battery.soc_percent = (battery.soc_percent - delta_pct).clamp(0.0, 100.0);
        }
        st.updated_at = now;
    }

    pub fn grid_power_w(&self) -> f64 {
        self.state.lock().grid_w()
    }

    pub fn battery_soc(&self, base: &str) -> Option<f64> {
        self.state.lock().batteries.get(base).map(|b| b.soc_percent)
    }
}

#[async_trait]
impl PointIo for SimulatedSite {
    async fn read_numeric(&self, point: &str) -> Result<PointValue<f64>, PointError> {
        let st = self.state.lock();
        let at = st.updated_at;
        if point == self.grid_point {
            return Ok(PointValue::new(st.grid_w(), at));
        }
        if self.pv_point.as_deref() == Some(point) {
            return Ok(PointValue::new(st.pv_w, at));
        }
        if self.wallbox_point.as_deref() == Some(point) {
            return Ok(PointValue::new(st.wallbox_w, at));
        }
        let battery = BatteryPoints::base_of(point).and_then(|base| st.batteries.get(base));
        match battery {
            Some(b) if point == b.points.soc => Ok(PointValue::new(b.soc_percent, at)),
            Some(b) if point == b.points.ac_power => Ok(PointValue::new(b.ac_power_w, at)),
            _ => Err(PointError::Unavailable(point.to_string())),
        }
    }

    async fn read_bool(&self, point: &str) -> Result<PointValue<bool>, PointError> {
        let st = self.state.lock();
        if self.cable_point.as_deref() == Some(point) {
            return Ok(PointValue::new(st.plugged, st.updated_at));
        }
        Err(PointError::Unavailable(point.to_string()))
    }

    async fn write(&self, point: &str, value: &CommandValue) -> Result<(), PointError> {
        let mut st = self.state.lock();
        let Some(battery) = BatteryPoints::base_of(point).and_then(|base| st.batteries.get_mut(base))
        else {
            return Err(PointError::Unavailable(point.to_string()));
        };
        let mismatch = || PointError::Transport {
            point: point.to_string(),
            message: format!("unexpected value '{value}'"),
        };
        match value {
            CommandValue::Number(w) if point == battery.points.charge_power => battery.charge_w = *w,
            CommandValue::Number(w) if point == battery.points.discharge_power => {
                battery.discharge_w = *w
            }
            CommandValue::Option(option) if point == battery.points.force_mode => {
                battery.mode = option.parse().map_err(|_| mismatch())?;
            }
            CommandValue::Switch(on) if point == battery.points.control_switch => {
                battery.control_on = *on
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}
