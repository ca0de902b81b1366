use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::WallboxConfig;
use crate::domain::{WallboxFlags, WallboxInputs, WallboxPhase};

/// Arbitration state carried between ticks
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WallboxState {
    pub phase: WallboxPhase,
    pub plugged: bool,
    pub power_w: f64,
    pub phase_since: Option<DateTime<Utc>>,
    /// Last time the car's draw rose by more than the fluctuation tolerance
    pub last_increase_at: Option<DateTime<Utc>>,
    /// Power level increases are measured against
    pub reference_power_w: f64,
    pub pause_started_at: Option<DateTime<Utc>>,
    pub not_drawing_since: Option<DateTime<Utc>>,
    /// Lowest draw seen since home charging resumed
    pub resume_baseline_w: f64,
    /// Latest retry window or surplus pause since plug-in; anchors the
    /// `retry_minutes` cooldown
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl WallboxState {
    fn enter(mut self, phase: WallboxPhase, now: DateTime<Utc>) -> Self {
        if self.phase != phase {
            self.phase = phase;
            self.phase_since = Some(now);
        }
        self
    }

    fn pause(mut self, power_w: f64, now: DateTime<Utc>) -> Self {
        self.pause_started_at = Some(now);
        self.last_increase_at = Some(now);
        self.reference_power_w = power_w;
        self.not_drawing_since = None;
        self.enter(WallboxPhase::ChargePausedForSurplus, now)
    }

    fn resume(mut self, power_w: f64, now: DateTime<Utc>) -> Self {
        self.resume_baseline_w = power_w;
        self.pause_started_at = None;
        self.not_drawing_since = None;
        self.enter(WallboxPhase::ResumePending, now)
    }

    fn idle(mut self, now: DateTime<Utc>) -> Self {
        self.pause_started_at = None;
        self.last_increase_at = None;
        self.not_drawing_since = None;
        self.enter(WallboxPhase::Idle, now)
    }
}

fn elapsed(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    since.map_or(Duration::zero(), |t| now - t)
}

/// Pure phase transition for one tick
pub fn transition(
    state: &WallboxState,
    inputs: &WallboxInputs,
    cfg: &WallboxConfig,
    now: DateTime<Utc>,
) -> WallboxState {
    if !inputs.plugged {
        return WallboxState {
            phase: WallboxPhase::Idle,
            phase_since: if state.phase == WallboxPhase::Idle {
                state.phase_since
            } else {
                Some(now)
            },
            plugged: false,
            power_w: inputs.power_w,
            ..WallboxState::default()
        };
    }

    let mut next = state.clone();
    next.plugged = true;
    next.power_w = inputs.power_w;

    let drawing = inputs.power_w > cfg.active_threshold_w;
    let surplus_high = inputs.surplus_w > cfg.max_surplus_w;
    let tolerance = cfg.fluctuation_tolerance_w;
    let start_delay = Duration::seconds(cfg.start_delay_seconds as i64);

    match state.phase {
        WallboxPhase::Idle => {
            if drawing {
                next.enter(WallboxPhase::CarActive, now)
            } else if cfg.retry_enabled() && surplus_high && retry_due(state, cfg, now) {
                next.last_attempt_at = Some(now);
                next.enter(WallboxPhase::RetryWindow, now)
            } else {
                next
            }
        }
        WallboxPhase::RetryWindow => {
            if drawing {
                next.enter(WallboxPhase::CarActive, now)
            } else if !surplus_high || elapsed(state.phase_since, now) >= start_delay {
                next.idle(now)
            } else {
                next
            }
        }
        WallboxPhase::CarActive => {
            if !drawing {
                next.idle(now)
            } else if surplus_high && retry_due(state, cfg, now) {
                next.last_attempt_at = Some(now);
                next.pause(inputs.power_w, now)
            } else {
                next
            }
        }
        WallboxPhase::ChargePausedForSurplus => {
            // surplus gone and the car never picked it up
            if !drawing && !surplus_high {
                return next.idle(now);
            }
            if inputs.power_w > state.reference_power_w + tolerance {
                next.last_increase_at = Some(now);
                next.reference_power_w = inputs.power_w;
            } else if inputs.power_w < state.reference_power_w - tolerance {
                next.reference_power_w = inputs.power_w;
            }

            if drawing {
                next.not_drawing_since = None;
            } else {
                let since = *next.not_drawing_since.get_or_insert(now);
                if now - since >= start_delay {
                    return next.resume(inputs.power_w, now);
                }
            }

            let stagnation = Duration::seconds(cfg.stagnation_seconds as i64);
            if elapsed(next.last_increase_at, now) >= stagnation {
                next.resume(inputs.power_w, now)
            } else {
                next
            }
        }
        WallboxPhase::ResumePending => {
            if !drawing {
                next.idle(now)
            } else if inputs.power_w > state.resume_baseline_w + tolerance {
                next.pause(inputs.power_w, now)
            } else {
                next.resume_baseline_w = state.resume_baseline_w.min(inputs.power_w);
                next
            }
        }
    }
}

fn retry_due(state: &WallboxState, cfg: &WallboxConfig, now: DateTime<Utc>) -> bool {
    match state.last_attempt_at {
        None => true,
        Some(last) => now - last >= Duration::minutes(cfg.retry_minutes as i64),
    }
}

/// Decides whether the home batteries may charge or discharge while an EV
/// is plugged in
#[derive(Debug, Clone)]
pub struct WallboxArbiter {
    cfg: WallboxConfig,
    enabled: bool,
    state: WallboxState,
}

impl WallboxArbiter {
    pub fn new(cfg: WallboxConfig) -> Self {
        let enabled = cfg.is_configured();
        if !enabled {
            debug!("wallbox sensors not configured, arbitration disabled");
        }
        Self {
            cfg,
            enabled,
            state: WallboxState::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn phase(&self) -> WallboxPhase {
        self.state.phase
    }

    pub fn state(&self) -> &WallboxState {
        &self.state
    }

    pub fn flags(&self) -> WallboxFlags {
        if self.enabled {
            self.state.phase.flags()
        } else {
            WallboxFlags::ALLOW_ALL
        }
    }

    /// Advances the state machine. `None` means the wallbox inputs were stale
    /// this tick.
    pub fn update(&mut self, inputs: Option<WallboxInputs>, now: DateTime<Utc>) -> WallboxFlags {
        if !self.enabled {
            return WallboxFlags::ALLOW_ALL;
        }

        let Some(inputs) = inputs else {
            if self.state.phase != WallboxPhase::Idle {
                warn!(phase = %self.state.phase, "wallbox inputs stale, releasing restrictions");
            }
            self.state = WallboxState {
                last_attempt_at: self.state.last_attempt_at,
                ..WallboxState::default()
            };
            return WallboxFlags::ALLOW_ALL;
        };

        let next = transition(&self.state, &inputs, &self.cfg, now);
        if next.phase != self.state.phase {
            info!(
                from = %self.state.phase,
                to = %next.phase,
                power_w = inputs.power_w,
                surplus_w = inputs.surplus_w,
                "wallbox phase changed"
            );
        }
        self.state = next;
        self.state.phase.flags()
    }
}
