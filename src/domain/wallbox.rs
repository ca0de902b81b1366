use serde::{Deserialize, Serialize};
use strum::Display;

use super::FlowDirection;

/// Phase of the wallbox arbitration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WallboxPhase {
    /// Not drawing power (or not plugged)
    #[default]
    Idle,
    /// Car is charging; home batteries must not discharge into it
    CarActive,
    /// Surplus is reserved for the car; home charging paused
    ChargePausedForSurplus,
    /// Car is presumed full or capped; home charging resumed
    ResumePending,
    /// Plugged but idle car is offered a bounded start-up window
    RetryWindow,
}

impl WallboxPhase {
    pub fn flags(self) -> WallboxFlags {
        match self {
            WallboxPhase::Idle => WallboxFlags::ALLOW_ALL,
            WallboxPhase::CarActive | WallboxPhase::ResumePending => WallboxFlags {
                charge_allowed: true,
                discharge_allowed: false,
            },
            WallboxPhase::ChargePausedForSurplus | WallboxPhase::RetryWindow => WallboxFlags {
                charge_allowed: false,
                discharge_allowed: false,
            },
        }
    }
}

/// Allow/block flags the dispatcher must honour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallboxFlags {
    pub charge_allowed: bool,
    pub discharge_allowed: bool,
}

impl WallboxFlags {
    pub const ALLOW_ALL: WallboxFlags = WallboxFlags {
        charge_allowed: true,
        discharge_allowed: true,
    };

    pub fn allows(&self, direction: FlowDirection) -> bool {
        match direction {
            FlowDirection::Charging => self.charge_allowed,
            FlowDirection::Discharging => self.discharge_allowed,
            FlowDirection::Idle => true,
        }
    }

    pub fn is_restricting(&self) -> bool {
        !(self.charge_allowed && self.discharge_allowed)
    }
}

impl Default for WallboxFlags {
    fn default() -> Self {
        Self::ALLOW_ALL
    }
}

/// Wallbox signals for one tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallboxInputs {
    pub plugged: bool,
    pub power_w: f64,
    /// Real PV surplus: grid export plus battery charge power currently flowing
    pub surplus_w: f64,
}
