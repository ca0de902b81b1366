use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use strum::Display;
use tracing::debug;

use super::pid::{GridPidController, PidState};
use super::priority::PriorityRanker;
use crate::config::{Config, GridConfig, LevelThresholds, LevelsConfig, PidConfig};
use crate::domain::{BatteryCommand, BatteryId, BatteryUnit, FlowDirection, WallboxFlags};

/// Most batteries the level bands can activate
pub const MAX_ACTIVE_UNITS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Level,
    Pid,
}

/// Per-tick inputs of the dispatcher
#[derive(Debug, Clone, Copy)]
pub struct DispatchInputs<'a> {
    pub units: &'a [BatteryUnit],
    /// Smoothed net grid power, positive = import
    pub grid_power_w: f64,
    /// Grid power with the batteries' own contribution removed
    pub real_power_w: f64,
    pub pv_power_w: Option<f64>,
    pub flags: WallboxFlags,
    /// Interval the setpoints are expected to hold for
    pub horizon_s: f64,
    pub now: DateTime<Utc>,
}

/// Per-battery targets for one tick
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DispatchPlan {
    pub mode: DispatchMode,
    pub direction: FlowDirection,
    /// Signed correction the batteries were asked to cover, before per-unit caps
    pub requested_w: f64,
    /// Eligible units for `direction`, in priority order
    pub priority: Vec<BatteryId>,
    /// Units selected to carry the correction
    pub active: Vec<BatteryId>,
    pub commands: BTreeMap<BatteryId, BatteryCommand>,
    pub blocked_by_wallbox: bool,
}

impl DispatchPlan {
    pub fn command_for(&self, id: BatteryId) -> BatteryCommand {
        self.commands
            .get(&id)
            .copied()
            .unwrap_or(BatteryCommand::Standby)
    }

    pub fn total_setpoint_w(&self) -> f64 {
        self.commands.values().map(BatteryCommand::setpoint_w).sum()
    }
}

/// Schmitt-trigger band selection of the active unit count.
///
/// Rising to the next count needs `level + offset`, falling back needs
/// `level - offset`; both comparisons are strict.
pub fn active_count_for(
    previous: usize,
    magnitude_w: f64,
    thresholds: &LevelThresholds,
    offset_w: f64,
) -> usize {
    let (l1, l2) = (thresholds.level1_w, thresholds.level2_w);
    match previous {
        0 | 1 => {
            if magnitude_w > l2 + offset_w {
                3
            } else if magnitude_w > l1 + offset_w {
                2
            } else {
                1
            }
        }
        2 => {
            if magnitude_w > l2 + offset_w {
                3
            } else if magnitude_w < l1 - offset_w {
                1
            } else {
                2
            }
        }
        _ => {
            if magnitude_w < l1 - offset_w {
                1
            } else if magnitude_w < l2 - offset_w {
                2
            } else {
                3
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LevelState {
    direction: FlowDirection,
    active_count: usize,
    below_min_ticks: u32,
}

/// Turns the grid balance into per-battery setpoints, either by banded
/// level selection or by the grid-zero PID loop.
#[derive(Debug, Clone)]
pub struct PowerDispatcher {
    levels: LevelsConfig,
    grid: GridConfig,
    pid_enabled: bool,
    pid: GridPidController,
    level_state: LevelState,
}

impl PowerDispatcher {
    pub fn new(levels: LevelsConfig, grid: GridConfig, pid: &PidConfig) -> Self {
        Self {
            levels,
            grid,
            pid_enabled: pid.enabled,
            pid: GridPidController::new(pid.kp, pid.ki, pid.kd),
            level_state: LevelState::default(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.levels.clone(), cfg.grid.clone(), &cfg.pid)
    }

    pub fn mode(&self) -> DispatchMode {
        if self.pid_enabled {
            DispatchMode::Pid
        } else {
            DispatchMode::Level
        }
    }

    /// Switches between level and PID mode. Returns true when the mode changed.
    pub fn set_pid_enabled(&mut self, enabled: bool) -> bool {
        if self.pid_enabled == enabled {
            return false;
        }
        if enabled {
            self.pid.reset();
        }
        self.level_state = LevelState::default();
        self.pid_enabled = enabled;
        true
    }

    pub fn active_count(&self) -> usize {
        self.level_state.active_count
    }

    pub fn pid_state(&self) -> PidState {
        self.pid.state()
    }

    pub fn plan(&mut self, ranker: &mut PriorityRanker, inputs: &DispatchInputs<'_>) -> DispatchPlan {
        match self.mode() {
            DispatchMode::Level => self.plan_levels(ranker, inputs, true),
            DispatchMode::Pid => self.plan_pid(ranker, inputs),
        }
    }

    /// Coarse battery count for CT mode. The minimum-power floor does not
    /// apply: with any eligible unit at least one is handed to its own meter.
    pub fn plan_ct(&mut self, ranker: &mut PriorityRanker, inputs: &DispatchInputs<'_>) -> DispatchPlan {
        self.plan_levels(ranker, inputs, false)
    }

    fn plan_levels(
        &mut self,
        ranker: &mut PriorityRanker,
        inputs: &DispatchInputs<'_>,
        apply_floor: bool,
    ) -> DispatchPlan {
        let direction = FlowDirection::from_real_power(inputs.real_power_w);
        let magnitude = inputs.real_power_w.abs();

        if direction != self.level_state.direction {
            self.level_state = LevelState {
                direction,
                ..LevelState::default()
            };
        }

        let priority = ranker.refresh(inputs.units, direction, inputs.now);
        let limit = MAX_ACTIVE_UNITS.min(priority.len());

        let count = if limit == 0 {
            0
        } else {
            let banded = active_count_for(
                self.level_state.active_count,
                magnitude,
                self.levels.thresholds(direction),
                self.levels.offset_w,
            );
            banded.clamp(1, limit)
        };

        let target = Self::pv_capped(direction, magnitude, inputs.pv_power_w);
        let count = if apply_floor && target < self.grid.min_power_w(direction) {
            self.level_state.below_min_ticks = self.level_state.below_min_ticks.saturating_add(1);
            if self.level_state.below_min_ticks >= self.grid.below_min_cycles_to_zero {
                0
            } else {
                count
            }
        } else {
            self.level_state.below_min_ticks = 0;
            count
        };
        self.level_state.active_count = count;

        debug!(
            %direction,
            real_power_w = inputs.real_power_w,
            target_w = target,
            active_count = count,
            below_min_ticks = self.level_state.below_min_ticks,
            "level dispatch"
        );

        let active = priority.top(count).to_vec();
        let plan = DispatchPlan {
            mode: DispatchMode::Level,
            direction,
            requested_w: signed(direction, target),
            commands: distribute(inputs.units, &active, direction, target, inputs.horizon_s),
            priority: priority.ids,
            active,
            blocked_by_wallbox: false,
        };
        apply_flags(plan, inputs.flags)
    }

    fn plan_pid(&mut self, ranker: &mut PriorityRanker, inputs: &DispatchInputs<'_>) -> DispatchPlan {
        let capacity = |direction: FlowDirection| -> f64 {
            if !inputs.flags.allows(direction) {
                return 0.0;
            }
            inputs
                .units
                .iter()
                .filter(|u| u.eligible_for(direction))
                .map(|u| u.power_cap_w(direction, inputs.horizon_s))
                .sum()
        };
        let max_charge = capacity(FlowDirection::Charging);
        let max_discharge = capacity(FlowDirection::Discharging);

        let output = self
            .pid
            .calculate(inputs.grid_power_w, max_charge, max_discharge, inputs.now);
        let direction = FlowDirection::from_setpoint(output);
        let priority = ranker.refresh(inputs.units, direction, inputs.now);

        let magnitude = Self::pv_capped(direction, output.abs(), inputs.pv_power_w);
        let active = if magnitude < self.grid.min_power_w(direction) {
            Vec::new()
        } else {
            priority.ids.clone()
        };

        let state = self.pid.state();
        debug!(
            grid_power_w = inputs.grid_power_w,
            output_w = output,
            integral = state.integral,
            max_charge_w = max_charge,
            max_discharge_w = max_discharge,
            active = active.len(),
            "pid dispatch"
        );

        let plan = DispatchPlan {
            mode: DispatchMode::Pid,
            direction,
            requested_w: signed(direction, magnitude),
            commands: distribute(inputs.units, &active, direction, magnitude, inputs.horizon_s),
            priority: priority.ids,
            active,
            blocked_by_wallbox: false,
        };
        apply_flags(plan, inputs.flags)
    }

    fn pv_capped(direction: FlowDirection, magnitude_w: f64, pv_power_w: Option<f64>) -> f64 {
        match (direction, pv_power_w) {
            (FlowDirection::Charging, Some(pv)) => magnitude_w.min(pv.max(0.0)),
            _ => magnitude_w,
        }
    }
}

fn signed(direction: FlowDirection, magnitude_w: f64) -> f64 {
    match direction {
        FlowDirection::Charging => magnitude_w,
        FlowDirection::Discharging => -magnitude_w,
        FlowDirection::Idle => 0.0,
    }
}

/// Even split across `active`, each share clamped to the unit's own cap.
/// Whatever a capped unit cannot take stays on the grid. Every other
/// available unit is held at standby.
fn distribute(
    units: &[BatteryUnit],
    active: &[BatteryId],
    direction: FlowDirection,
    target_w: f64,
    horizon_s: f64,
) -> BTreeMap<BatteryId, BatteryCommand> {
    let mut commands: BTreeMap<BatteryId, BatteryCommand> = units
        .iter()
        .filter(|u| u.available)
        .map(|u| (u.id, BatteryCommand::Standby))
        .collect();

    if active.is_empty() || target_w <= 0.0 {
        return commands;
    }

    let share = target_w / active.len() as f64;
    for id in active {
        let Some(unit) = units.iter().find(|u| u.id == *id) else {
            continue;
        };
        let cap = unit.power_cap_w(direction, horizon_s);
        let power = share.round().min(cap.floor()).max(0.0);
        commands.insert(*id, BatteryCommand::from_setpoint(signed(direction, power)));
    }
    commands
}

fn apply_flags(mut plan: DispatchPlan, flags: WallboxFlags) -> DispatchPlan {
    for command in plan.commands.values_mut() {
        if !flags.allows(command.direction()) {
            *command = BatteryCommand::Standby;
            plan.blocked_by_wallbox = true;
        }
    }
    plan
}
