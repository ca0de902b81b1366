use serde::Serialize;

use super::command_gate::CommandGate;
use super::dispatch::{DispatchInputs, DispatchPlan, PowerDispatcher};
use super::inputs::TickInputs;
use super::priority::PriorityRanker;
use super::smoothing::{SignalSmoother, SmoothedSignal};
use super::wallbox::WallboxArbiter;
use crate::config::Config;
use crate::domain::{WallboxFlags, WallboxInputs};

/// All state the control loop carries between ticks
#[derive(Debug, Clone)]
pub struct ControlContext {
    pub smoother: SignalSmoother,
    pub ranker: PriorityRanker,
    pub dispatcher: PowerDispatcher,
    pub wallbox: WallboxArbiter,
    pub gate: CommandGate,
}

/// Outcome of the synchronous decision step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub grid: SmoothedSignal,
    pub real_power_w: f64,
    pub flags: WallboxFlags,
    pub plan: DispatchPlan,
}

impl ControlContext {
    pub fn new(cfg: &Config) -> Self {
        Self {
            smoother: SignalSmoother::new(cfg.grid.smoothing_seconds),
            ranker: PriorityRanker::new(cfg.controller.priority_interval_minutes)
                .with_min_refresh(cfg.controller.priority_min_refresh_seconds),
            dispatcher: PowerDispatcher::from_config(cfg),
            wallbox: WallboxArbiter::new(cfg.wallbox.clone()),
            gate: CommandGate::new(cfg.controller.command_cache_seconds),
        }
    }

    /// Smooth, arbitrate, rank and dispatch for one tick. No I/O.
    ///
    /// In CT mode the level bands only decide how many batteries are handed
    /// to the host's own regulation, and at least one always is.
    pub fn decide(&mut self, inputs: &TickInputs, ct_mode: bool, horizon_s: f64) -> Decision {
        self.smoother.observe(inputs.grid);
        let grid = self.smoother.signal();
        let smoothed_grid_w = grid.value;

        let battery_ac_w: f64 = inputs
            .units
            .iter()
            .filter(|u| u.available)
            .map(|u| u.ac_power_w)
            .sum();
        let real_power_w = smoothed_grid_w + battery_ac_w;

        let wallbox = inputs.wallbox.map(|w| WallboxInputs {
            plugged: w.plugged,
            power_w: w.power_w,
            surplus_w: -real_power_w,
        });
        let flags = self.wallbox.update(wallbox, inputs.now);

        let dispatch = DispatchInputs {
            units: &inputs.units,
            grid_power_w: smoothed_grid_w,
            real_power_w,
            pv_power_w: inputs.pv_power_w,
            flags,
            horizon_s,
            now: inputs.now,
        };
        let plan = if ct_mode {
            self.dispatcher.plan_ct(&mut self.ranker, &dispatch)
        } else {
            self.dispatcher.plan(&mut self.ranker, &dispatch)
        };

        Decision {
            grid,
            real_power_w,
            flags,
            plan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::inputs::WallboxReading;
    use crate::domain::{BatteryCommand, BatteryId, BatteryUnit, FlowDirection, GridSample, WallboxPhase};
    use chrono::{Duration, TimeZone, Utc};

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.batteries.unit_1 = "venus_a".into();
        cfg.batteries.unit_2 = "venus_b".into();
        cfg.grid.smoothing_seconds = 0;
        cfg.wallbox.power_sensor = Some("sensor.wallbox_power".into());
        cfg.wallbox.cable_sensor = Some("binary_sensor.wallbox_cable".into());
        cfg
    }

    fn tick(cfg: &Config, grid_w: f64, ac: [f64; 2], wallbox: Option<WallboxReading>, s: i64) -> TickInputs {
        let now = Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap() + Duration::seconds(s);
        let units = cfg
            .batteries
            .slots()
            .into_iter()
            .zip(ac)
            .map(|((id, name), ac_power_w)| BatteryUnit {
                soc_percent: 50.0,
                ac_power_w,
                available: true,
                ..BatteryUnit::new(id, name, cfg.batteries.limits())
            })
            .collect();
        TickInputs {
            now,
            grid: GridSample::new(now, grid_w),
            pv_power_w: None,
            units,
            wallbox,
        }
    }

    #[test]
    fn test_real_power_adds_battery_output() {
        let cfg = cfg();
        let mut ctx = ControlContext::new(&cfg);
        // battery 1 already covers 400 W, grid still imports 100 W
        let d = ctx.decide(&tick(&cfg, 100.0, [400.0, 0.0], None, 0), false, 2.0);
        assert_eq!(d.real_power_w, 500.0);
        assert_eq!(d.plan.direction, FlowDirection::Discharging);
        assert_eq!(d.plan.total_setpoint_w(), -500.0);
    }

    #[test]
    fn test_car_charging_blocks_discharge() {
        let cfg = cfg();
        let mut ctx = ControlContext::new(&cfg);
        let wb = Some(WallboxReading {
            plugged: true,
            power_w: 7000.0,
        });
        let d = ctx.decide(&tick(&cfg, 6500.0, [0.0, 0.0], wb, 0), false, 2.0);
        assert_eq!(ctx.wallbox.phase(), WallboxPhase::CarActive);
        assert!(d.plan.blocked_by_wallbox);
        assert_eq!(d.plan.command_for(BatteryId(1)), BatteryCommand::Standby);
        assert_eq!(d.plan.command_for(BatteryId(2)), BatteryCommand::Standby);
    }

    #[test]
    fn test_surplus_includes_battery_charging() {
        let cfg = cfg();
        let mut ctx = ControlContext::new(&cfg);
        let wb = Some(WallboxReading {
            plugged: true,
            power_w: 1400.0,
        });
        ctx.decide(&tick(&cfg, 0.0, [0.0, 0.0], wb, 0), false, 2.0);
        // grid balanced only because both batteries absorb 1000 W each
        ctx.decide(&tick(&cfg, 0.0, [-1000.0, -1000.0], wb, 2), false, 2.0);
        assert_eq!(ctx.wallbox.phase(), WallboxPhase::ChargePausedForSurplus);
    }

    #[test]
    fn test_ct_mode_always_uses_levels() {
        let mut cfg = cfg();
        cfg.pid.enabled = true;
        let mut ctx = ControlContext::new(&cfg);
        let d = ctx.decide(&tick(&cfg, 2500.0, [0.0, 0.0], None, 0), true, 10.0);
        assert_eq!(d.plan.mode, crate::controller::DispatchMode::Level);
        assert_eq!(d.plan.active.len(), 2);
    }
}
