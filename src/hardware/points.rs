use strum::{Display, EnumString};

/// Option values of a battery's force-mode select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ForceMode {
    Charge,
    Discharge,
    Standby,
}

/// Point identifiers of one battery, derived from its base name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryPoints {
    pub soc: String,
    pub ac_power: String,
    pub charge_power: String,
    pub discharge_power: String,
    pub force_mode: String,
    pub control_switch: String,
}

impl BatteryPoints {
    pub fn for_base(base: &str) -> Self {
        Self {
            soc: format!("sensor.{base}_battery_soc"),
            ac_power: format!("sensor.{base}_ac_power"),
            charge_power: format!("number.{base}_modbus_set_forcible_charge_power"),
            discharge_power: format!("number.{base}_modbus_set_forcible_discharge_power"),
            force_mode: format!("select.{base}_modbus_force_mode"),
            control_switch: format!("switch.{base}_modbus_rs485_control_mode"),
        }
    }

    /// Base name back from any point of this battery family
    pub fn base_of(point: &str) -> Option<&str> {
        const SUFFIXES: [(&str, &str); 6] = [
            ("sensor.", "_battery_soc"),
            ("sensor.", "_ac_power"),
            ("number.", "_modbus_set_forcible_charge_power"),
            ("number.", "_modbus_set_forcible_discharge_power"),
            ("select.", "_modbus_force_mode"),
            ("switch.", "_modbus_rs485_control_mode"),
        ];
        SUFFIXES.iter().find_map(|(prefix, suffix)| {
            point.strip_prefix(prefix)?.strip_suffix(suffix)
        })
    }
}
