use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// Stable identifier of a battery slot (1..=3)
///
/// Ordering follows the slot number and is used as the tie-break whenever two
/// units rank equally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatteryId(pub u8);

impl fmt::Display for BatteryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "battery_{}", self.0)
    }
}

/// Direction of the power flow the batteries are asked to cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowDirection {
    #[default]
    Idle,
    Charging,
    Discharging,
}

impl FlowDirection {
    /// Direction implied by the house balance excluding batteries.
    /// Negative real power is surplus (charge), positive is import (discharge).
    pub fn from_real_power(real_power_w: f64) -> Self {
        if real_power_w < 0.0 {
            FlowDirection::Charging
        } else if real_power_w > 0.0 {
            FlowDirection::Discharging
        } else {
            FlowDirection::Idle
        }
    }

    /// Direction of a signed setpoint (positive = charge)
    pub fn from_setpoint(setpoint_w: f64) -> Self {
        if setpoint_w > 0.0 {
            FlowDirection::Charging
        } else if setpoint_w < 0.0 {
            FlowDirection::Discharging
        } else {
            FlowDirection::Idle
        }
    }
}

/// Static per-unit limits, copied from configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryLimits {
    pub min_soc_percent: f64,
    pub max_soc_percent: f64,
    pub max_charge_w: f64,
    pub max_discharge_w: f64,
    pub capacity_wh: f64,
}

impl Default for BatteryLimits {
    fn default() -> Self {
        Self {
            min_soc_percent: 10.0,
            max_soc_percent: 95.0,
            max_charge_w: 2500.0,
            max_discharge_w: 2500.0,
            capacity_wh: 5120.0,
        }
    }
}

/// One battery as seen by the controller for the current tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryUnit {
    pub id: BatteryId,
    /// Base name the point identifiers are derived from
    pub name: String,
    pub soc_percent: f64,
    /// AC power at the inverter: positive = discharging, negative = charging
    pub ac_power_w: f64,
    pub limits: BatteryLimits,
    /// False when the unit's readings were missing or stale this tick
    pub available: bool,
}

impl BatteryUnit {
    pub fn new(id: BatteryId, name: impl Into<String>, limits: BatteryLimits) -> Self {
        Self {
            id,
            name: name.into(),
            soc_percent: 0.0,
            ac_power_w: 0.0,
            limits,
            available: false,
        }
    }

    pub fn eligible_for(&self, direction: FlowDirection) -> bool {
        if !self.available {
            return false;
        }
        match direction {
            FlowDirection::Charging => self.soc_percent < self.limits.max_soc_percent,
            FlowDirection::Discharging => self.soc_percent > self.limits.min_soc_percent,
            FlowDirection::Idle => false,
        }
    }

    pub fn max_power_w(&self, direction: FlowDirection) -> f64 {
        match direction {
            FlowDirection::Charging => self.limits.max_charge_w,
            FlowDirection::Discharging => self.limits.max_discharge_w,
            FlowDirection::Idle => 0.0,
        }
    }

    /// Largest power that can flow for `horizon_s` seconds without crossing
    /// the SoC bound of `direction`.
    pub fn headroom_w(&self, direction: FlowDirection, horizon_s: f64) -> f64 {
        let soc_span = match direction {
            FlowDirection::Charging => self.limits.max_soc_percent - self.soc_percent,
            FlowDirection::Discharging => self.soc_percent - self.limits.min_soc_percent,
            FlowDirection::Idle => 0.0,
        };
        if soc_span <= 0.0 {
            return 0.0;
        }
        let energy_wh = soc_span / 100.0 * self.limits.capacity_wh;
        energy_wh * 3600.0 / horizon_s.max(1.0)
    }

    /// Effective per-unit power cap: configured max or SoC headroom, whichever is lower
    pub fn power_cap_w(&self, direction: FlowDirection, horizon_s: f64) -> f64 {
        self.max_power_w(direction)
            .min(self.headroom_w(direction, horizon_s))
            .max(0.0)
    }
}

/// Battery command for one tick
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", content = "power_w", rename_all = "snake_case")]
pub enum BatteryCommand {
    Charge(f64),    // Charge at specified watts
    Discharge(f64), // Discharge at specified watts
    Standby,        // Hold at 0 W
}

impl BatteryCommand {
    /// Build from a signed setpoint (positive = charge). Zero maps to standby.
    pub fn from_setpoint(setpoint_w: f64) -> Self {
        if setpoint_w > 0.0 {
            BatteryCommand::Charge(setpoint_w)
        } else if setpoint_w < 0.0 {
            BatteryCommand::Discharge(-setpoint_w)
        } else {
            BatteryCommand::Standby
        }
    }

    pub fn setpoint_w(&self) -> f64 {
        match *self {
            BatteryCommand::Charge(w) => w,
            BatteryCommand::Discharge(w) => -w,
            BatteryCommand::Standby => 0.0,
        }
    }

    pub fn magnitude_w(&self) -> f64 {
        self.setpoint_w().abs()
    }

    pub fn direction(&self) -> FlowDirection {
        FlowDirection::from_setpoint(self.setpoint_w())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(soc: f64) -> BatteryUnit {
        BatteryUnit {
            soc_percent: soc,
            available: true,
            ..BatteryUnit::new(BatteryId(1), "venus_1", BatteryLimits::default())
        }
    }

    #[test]
    fn test_eligibility_respects_bounds() {
        assert!(unit(50.0).eligible_for(FlowDirection::Charging));
        assert!(!unit(95.0).eligible_for(FlowDirection::Charging));
        assert!(unit(50.0).eligible_for(FlowDirection::Discharging));
        assert!(!unit(10.0).eligible_for(FlowDirection::Discharging));
        assert!(!unit(50.0).eligible_for(FlowDirection::Idle));
    }

    #[test]
    fn test_unavailable_unit_is_never_eligible() {
        let mut u = unit(50.0);
        u.available = false;
        assert!(!u.eligible_for(FlowDirection::Charging));
        assert!(!u.eligible_for(FlowDirection::Discharging));
    }

    #[test]
    fn test_headroom_limits_cap_near_bound() {
        // 0.01 % of 5120 Wh = 0.512 Wh; over 2 s that is 921.6 W
        let u = unit(94.99);
        let cap = u.power_cap_w(FlowDirection::Charging, 2.0);
        assert!((cap - 921.6).abs() < 0.5, "cap was {cap}");
        assert_eq!(unit(50.0).power_cap_w(FlowDirection::Charging, 2.0), 2500.0);
    }

    #[test]
    fn test_command_setpoint_sign() {
        assert_eq!(BatteryCommand::from_setpoint(300.0), BatteryCommand::Charge(300.0));
        assert_eq!(BatteryCommand::from_setpoint(-300.0), BatteryCommand::Discharge(300.0));
        assert_eq!(BatteryCommand::from_setpoint(0.0), BatteryCommand::Standby);
        assert_eq!(BatteryCommand::Discharge(200.0).setpoint_w(), -200.0);
    }

    #[test]
    fn test_direction_from_real_power() {
        assert_eq!(FlowDirection::from_real_power(-10.0), FlowDirection::Charging);
        assert_eq!(FlowDirection::from_real_power(10.0), FlowDirection::Discharging);
        assert_eq!(FlowDirection::from_real_power(0.0), FlowDirection::Idle);
        assert_eq!("charging".parse::<FlowDirection>().ok(), Some(FlowDirection::Charging));
    }
}
