use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::domain::BatteryCommand;
use crate::error::ControlError;
use crate::hardware::{BatteryPoints, CommandValue, ForceMode, PointIo};

/// Last value sent to one control point
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCacheEntry {
    pub value: CommandValue,
    pub sent_at: DateTime<Utc>,
}

/// Suppresses writes that would repeat the last delivered value
///
/// An identical value is re-sent only once the TTL has expired; a TTL of zero
/// suppresses it until the value changes.
#[derive(Debug, Clone)]
pub struct CommandGate {
    ttl: Duration,
    entries: HashMap<String, CommandCacheEntry>,
}

impl CommandGate {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds as i64),
            entries: HashMap::new(),
        }
    }

    fn suppresses(&self, point: &str, value: &CommandValue, now: DateTime<Utc>) -> bool {
        match self.entries.get(point) {
            Some(entry) if entry.value == *value => {
                self.ttl.is_zero() || now - entry.sent_at < self.ttl
            }
            _ => false,
        }
    }

    /// Forwards the write unless it is redundant. Returns whether a write was
    /// issued. A failed write leaves the cache untouched.
    pub async fn send(
        &mut self,
        io: &dyn PointIo,
        point: &str,
        value: CommandValue,
        now: DateTime<Utc>,
    ) -> Result<bool, ControlError> {
        if self.suppresses(point, &value, now) {
            return Ok(false);
        }

        io.write(point, &value)
            .await
            .map_err(|source| ControlError::WriteFailure {
                point: point.to_string(),
                source,
            })?;

        debug!(point, %value, "command sent");
        self.entries.insert(
            point.to_string(),
            CommandCacheEntry {
                value,
                sent_at: now,
            },
        );
        Ok(true)
    }

    /// Writes one battery command in protocol order: control switch, power
    /// number, force mode. Stops at the first failed write.
    ///
    /// Without mode control the power numbers alone select the direction, so
    /// the opposite number is zeroed before the new setpoint is written.
    pub async fn apply(
        &mut self,
        io: &dyn PointIo,
        points: &BatteryPoints,
        command: BatteryCommand,
        explicit_mode_control: bool,
        now: DateTime<Utc>,
    ) -> Result<usize, ControlError> {
        let mut writes: Vec<(&str, CommandValue)> = Vec::with_capacity(4);
        if explicit_mode_control {
            writes.push((points.control_switch.as_str(), CommandValue::Switch(true)));
        }
        let mode = match command {
            BatteryCommand::Charge(w) => {
                if !explicit_mode_control {
                    writes.push((points.discharge_power.as_str(), CommandValue::Number(0.0)));
                }
                writes.push((points.charge_power.as_str(), CommandValue::Number(w)));
                ForceMode::Charge
            }
            BatteryCommand::Discharge(w) => {
                if !explicit_mode_control {
                    writes.push((points.charge_power.as_str(), CommandValue::Number(0.0)));
                }
                writes.push((points.discharge_power.as_str(), CommandValue::Number(w)));
                ForceMode::Discharge
            }
            BatteryCommand::Standby => {
                writes.push((points.charge_power.as_str(), CommandValue::Number(0.0)));
                writes.push((points.discharge_power.as_str(), CommandValue::Number(0.0)));
                ForceMode::Standby
            }
        };
        if explicit_mode_control {
            writes.push((points.force_mode.as_str(), CommandValue::Option(mode.to_string())));
        }

        let mut sent = 0;
        for (point, value) in writes {
            if self.send(io, point, value, now).await? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Hands a battery over to its own regulation by switching host control off
    pub async fn release(
        &mut self,
        io: &dyn PointIo,
        points: &BatteryPoints,
        now: DateTime<Utc>,
    ) -> Result<bool, ControlError> {
        self.send(io, &points.control_switch, CommandValue::Switch(false), now)
            .await
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PointError;
    use crate::hardware::{MemoryPoints, MockPointIo};
    use chrono::TimeZone;
    use mockall::predicate::*;

    const POINT: &str = "number.venus_a_modbus_set_forcible_charge_power";

    fn t(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap() + Duration::seconds(s)
    }

    #[tokio::test]
    async fn test_identical_value_within_ttl_is_written_once() {
        let mut io = MockPointIo::new();
        io.expect_write()
            .with(eq(POINT), eq(CommandValue::Number(800.0)))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut gate = CommandGate::new(30);
        assert!(gate.send(&io, POINT, CommandValue::Number(800.0), t(0)).await.unwrap());
        assert!(!gate.send(&io, POINT, CommandValue::Number(800.0), t(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_value_change_forwards_immediately() {
        let mut io = MockPointIo::new();
        io.expect_write().times(2).returning(|_, _| Ok(()));

        let mut gate = CommandGate::new(30);
        gate.send(&io, POINT, CommandValue::Number(800.0), t(0)).await.unwrap();
        assert!(gate.send(&io, POINT, CommandValue::Number(900.0), t(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_is_resent() {
        let mut io = MockPointIo::new();
        io.expect_write().times(2).returning(|_, _| Ok(()));

        let mut gate = CommandGate::new(30);
        gate.send(&io, POINT, CommandValue::Number(800.0), t(0)).await.unwrap();
        assert!(gate.send(&io, POINT, CommandValue::Number(800.0), t(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_suppresses_until_changed() {
        let mut io = MockPointIo::new();
        io.expect_write().times(1).returning(|_, _| Ok(()));

        let mut gate = CommandGate::new(0);
        gate.send(&io, POINT, CommandValue::Number(800.0), t(0)).await.unwrap();
        assert!(!gate.send(&io, POINT, CommandValue::Number(800.0), t(3600)).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_is_not_cached() {
        let mut io = MockPointIo::new();
        let mut seq = mockall::Sequence::new();
        io.expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p, _| {
                Err(PointError::Transport {
                    point: p.to_string(),
                    message: "timeout".into(),
                })
            });
        io.expect_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut gate = CommandGate::new(30);
        let err = gate
            .send(&io, POINT, CommandValue::Number(800.0), t(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::WriteFailure { .. }));
        assert!(gate.is_empty());
        assert!(gate.send(&io, POINT, CommandValue::Number(800.0), t(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_follows_protocol_order() {
        let io = MemoryPoints::new();
        let points = BatteryPoints::for_base("venus_a");
        let mut gate = CommandGate::new(30);

        let sent = gate
            .apply(&io, &points, BatteryCommand::Discharge(600.0), true, t(0))
            .await
            .unwrap();
        assert_eq!(sent, 3);
        let log: Vec<String> = io.write_log().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            log,
            vec![
                points.control_switch.clone(),
                points.discharge_power.clone(),
                points.force_mode.clone()
            ]
        );
        assert_eq!(
            io.last_written(&points.force_mode),
            Some(CommandValue::Option("discharge".into()))
        );
    }

    #[tokio::test]
    async fn test_direction_flip_without_mode_control_zeroes_opposite_number() {
        let io = MemoryPoints::new();
        let points = BatteryPoints::for_base("venus_a");
        let mut gate = CommandGate::new(30);

        let sent = gate
            .apply(&io, &points, BatteryCommand::Discharge(600.0), false, t(0))
            .await
            .unwrap();
        assert_eq!(sent, 2);
        gate.apply(&io, &points, BatteryCommand::Charge(500.0), false, t(2))
            .await
            .unwrap();

        assert_eq!(io.last_number(&points.charge_power), Some(500.0));
        assert_eq!(io.last_number(&points.discharge_power), Some(0.0));
        let log: Vec<String> = io.write_log().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            log[2..],
            [points.discharge_power.clone(), points.charge_power.clone()]
        );
    }

    #[tokio::test]
    async fn test_standby_zeroes_both_numbers() {
        let io = MemoryPoints::new();
        let points = BatteryPoints::for_base("venus_a");
        let mut gate = CommandGate::new(30);

        gate.apply(&io, &points, BatteryCommand::Standby, false, t(0))
            .await
            .unwrap();
        assert_eq!(io.last_number(&points.charge_power), Some(0.0));
        assert_eq!(io.last_number(&points.discharge_power), Some(0.0));
        assert_eq!(io.last_written(&points.force_mode), None);
    }
}
