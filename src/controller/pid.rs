/// PID (Proportional-Integral-Derivative) Controller
///
/// A PID controller continuously calculates an error value as the difference
/// between a desired setpoint and a measured process variable, and applies
/// a correction based on proportional, integral, and derivative terms.
///
/// Output = Kp * error + Ki * ∫error*dt + Kd * d(error)/dt
///
/// The output clamp doubles as anti-windup: while the output is saturated in
/// the direction the error pushes, the integral is frozen.
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Internal controller state, exposed for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PidState {
    pub integral: f64,
    pub previous_error: Option<f64>,
    pub previous_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PidController {
    /// Proportional gain
    kp: f64,
    /// Integral gain
    ki: f64,
    /// Derivative gain
    kd: f64,

    /// Target setpoint
    setpoint: f64,

    state: PidState,

    /// Output limits
    output_min: f64,
    output_max: f64,
}

impl PidController {
    /// Create a new PID controller without output limits
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self::with_limits(kp, ki, kd, f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Create a PID controller with output limits
    pub fn with_limits(kp: f64, ki: f64, kd: f64, output_min: f64, output_max: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint: 0.0,
            state: PidState::default(),
            output_min,
            output_max,
        }
    }

    /// Set the target setpoint
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// The physical limits change every tick with the eligible set
    pub fn set_output_limits(&mut self, output_min: f64, output_max: f64) {
        self.output_min = output_min.min(output_max);
        self.output_max = output_max.max(output_min);
    }

    /// Reset the controller state
    pub fn reset(&mut self) {
        self.state = PidState::default();
    }

    /// Calculate control output based on current process value
    ///
    /// # Arguments
    /// * `process_value` - Current measured value
    /// * `dt` - Time delta since last update (in seconds)
    pub fn update(&mut self, process_value: f64, dt: f64) -> f64 {
        let error = self.setpoint - process_value;
        let dt = dt.max(0.0);

        let p_term = self.kp * error;

        let d_term = match self.state.previous_error {
            Some(prev) if dt > 0.0 => self.kd * (error - prev) / dt,
            _ => 0.0,
        };

        let candidate = self.state.integral + error * dt;
        let unclamped = p_term + self.ki * candidate + d_term;
        let saturated = unclamped > self.output_max || unclamped < self.output_min;
        let winding_up = saturated && error != 0.0 && error.signum() == unclamped.signum();
        if !winding_up {
            self.state.integral = candidate;
        }

        let output = p_term + self.ki * self.state.integral + d_term;
        self.state.previous_error = Some(error);

        output.clamp(self.output_min, self.output_max)
    }

    /// Calculate control output, deriving dt from the previous timestamp.
    /// The first call after a reset integrates nothing.
    pub fn update_at(&mut self, process_value: f64, now: DateTime<Utc>) -> f64 {
        let dt = match self.state.previous_timestamp {
            Some(last) => (now - last).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        };
        let output = self.update(process_value, dt);
        self.state.previous_timestamp = Some(now);
        output
    }

    /// Get current integral term (useful for debugging)
    pub fn integral(&self) -> f64 {
        self.state.integral
    }

    /// Get previous error (useful for debugging)
    pub fn previous_error(&self) -> Option<f64> {
        self.state.previous_error
    }

    pub fn state(&self) -> PidState {
        self.state
    }
}

/// Grid-zero PID: drives net grid power to 0 W
///
/// Output sign follows battery setpoints: positive = charge, negative = discharge.
#[derive(Debug, Clone)]
pub struct GridPidController {
    pid: PidController,
}

impl GridPidController {
    /// Outputs below this magnitude are treated as zero
    pub const DEADBAND_W: f64 = 1.0;

    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        let mut pid = PidController::new(kp, ki, kd);
        pid.set_setpoint(0.0);
        Self { pid }
    }

    /// Calculate the battery setpoint for a measured grid power
    ///
    /// `max_charge_w` / `max_discharge_w` are the total powers the eligible
    /// batteries can currently absorb / deliver.
    pub fn calculate(
        &mut self,
        grid_power_w: f64,
        max_charge_w: f64,
        max_discharge_w: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        self.pid
            .set_output_limits(-max_discharge_w.max(0.0), max_charge_w.max(0.0));
        let output = self.pid.update_at(grid_power_w, now);
        if output.abs() < Self::DEADBAND_W {
            0.0
        } else {
            output
        }
    }

    pub fn reset(&mut self) {
        self.pid.reset();
    }

    pub fn state(&self) -> PidState {
        self.pid.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_pid_proportional_only() {
        let mut pid = PidController::new(1.0, 0.0, 0.0);
        pid.set_setpoint(100.0);

        // With only P control, output should be proportional to error
        let output = pid.update(90.0, 1.0);
        assert!((output - 10.0).abs() < 0.01); // Error is 10, Kp is 1.0
    }

    #[test]
    fn test_pid_integral_accumulation() {
        let mut pid = PidController::new(0.0, 1.0, 0.0);
        pid.set_setpoint(100.0);

        let _ = pid.update(90.0, 1.0); // Error = 10, integral = 10
        let output = pid.update(90.0, 1.0); // Error = 10, integral = 20
        assert!((output - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_pid_derivative() {
        let mut pid = PidController::new(0.0, 0.0, 1.0);
        pid.set_setpoint(100.0);

        let _ = pid.update(90.0, 1.0); // Error = 10
        let output = pid.update(95.0, 1.0); // Error = 5, derivative = (5-10)/1 = -5
        assert!((output - (-5.0)).abs() < 0.01);
    }

    #[test]
    fn test_pid_output_clamping() {
        let mut pid = PidController::with_limits(1.0, 0.0, 0.0, -50.0, 50.0);
        pid.set_setpoint(200.0);

        let output = pid.update(0.0, 1.0); // Error = 200, P term = 200
        assert_eq!(output, 50.0);
    }

    #[test]
    fn test_integral_frozen_while_saturated() {
        let mut pid = PidController::with_limits(0.0, 1.0, 0.0, -10.0, 10.0);
        pid.set_setpoint(100.0);

        for _ in 0..100 {
            let _ = pid.update(0.0, 1.0);
        }
        // accumulation stops once Ki * integral would exceed the clamp
        assert!(pid.integral() <= 100.0);

        // error reverses: output leaves saturation immediately
        let output = pid.update(200.0, 1.0);
        assert!(output < 10.0);
    }

    #[test]
    fn test_integral_unwinds_when_error_reverses() {
        let mut pid = PidController::with_limits(0.0, 1.0, 0.0, -10.0, 10.0);
        let _ = pid.update(-5.0, 1.0); // error 5, integral 5
        let _ = pid.update(-5.0, 1.0); // integral 10
        assert_eq!(pid.integral(), 10.0);
        let _ = pid.update(3.0, 1.0); // error -3
        assert_eq!(pid.integral(), 7.0);
    }

    #[test]
    fn test_pid_reset() {
        let mut pid = PidController::new(1.0, 1.0, 1.0);
        pid.set_setpoint(100.0);

        let _ = pid.update(50.0, 1.0);
        assert!(pid.integral() != 0.0);
        assert!(pid.previous_error().is_some());

        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.previous_error(), None);
    }

    #[test]
    fn test_first_timed_update_does_not_integrate() {
        let mut pid = PidController::new(0.0, 1.0, 0.0);
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let _ = pid.update_at(-10.0, t0);
        assert_eq!(pid.integral(), 0.0);
        let _ = pid.update_at(-10.0, t0 + Duration::seconds(2));
        assert_eq!(pid.integral(), 20.0);
    }

    #[test]
    fn test_grid_pid_discharges_on_import() {
        let mut pid = GridPidController::new(0.6, 0.02, 0.0);
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let out = pid.calculate(300.0, 2500.0, 2500.0, t0);
        assert!((out + 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_grid_pid_deadband() {
        let mut pid = GridPidController::new(0.6, 0.0, 0.0);
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(pid.calculate(1.0, 2500.0, 2500.0, t0), 0.0);
    }

    #[test]
    fn test_step_response() {
        let mut pid = PidController::new(0.5, 0.1, 0.05);
        pid.set_setpoint(100.0);

        let mut value = 0.0;
        for _ in 0..20 {
            let control = pid.update(value, 0.1);
            value += control * 0.1; // Simple simulation
        }

        assert!(value > 50.0);
    }
}
