pub mod command_gate;
pub mod context;
pub mod dispatch;
pub mod inputs;
pub mod pid;
pub mod priority;
pub mod smoothing;
pub mod wallbox;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{BatteryCommand, BatteryId, FlowDirection, WallboxFlags, WallboxPhase};
use crate::error::ControlError;
use crate::hardware::PointIo;

pub use command_gate::CommandGate;
pub use context::{ControlContext, Decision};
pub use dispatch::{DispatchMode, DispatchPlan, PowerDispatcher};
pub use inputs::{BatterySlot, InputReader, TickInputs};
pub use pid::{GridPidController, PidController, PidState};
pub use priority::{PriorityList, PriorityRanker};
pub use smoothing::{SignalSmoother, SmoothedSignal};
pub use wallbox::{WallboxArbiter, WallboxState};

/// Diagnostics snapshot of one completed tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub mode: DispatchMode,
    pub ct_mode: bool,
    pub raw_grid_w: f64,
    pub smoothed_grid_w: f64,
    pub smoothing_window_s: u64,
    pub real_power_w: f64,
    pub direction: FlowDirection,
    pub priority: Vec<BatteryId>,
    pub active: Vec<BatteryId>,
    pub wallbox_phase: WallboxPhase,
    pub flags: WallboxFlags,
    pub pid_integral: Option<f64>,
    pub commands: BTreeMap<BatteryId, BatteryCommand>,
    pub stale_batteries: Vec<BatteryId>,
    pub writes: usize,
    pub write_failures: usize,
    pub cache_entries: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct WriteStats {
    writes: usize,
    failures: usize,
}

impl WriteStats {
    fn record<T>(&mut self, result: Result<T, ControlError>, battery: &BatterySlot)
    where
        T: Into<usize>,
    {
        match result {
            Ok(sent) => self.writes += sent.into(),
            Err(err) => {
                self.failures += 1;
                warn!(battery = %battery.id, name = %battery.name, error = %err, "battery command not delivered");
            }
        }
    }
}

/// Bounds one battery's writes by the tick timeout so a hung point cannot
/// stall the loop or shutdown
async fn bounded<T>(
    limit: Duration,
    battery: &BatterySlot,
    writes: impl Future<Output = Result<T, ControlError>>,
) -> Result<T, ControlError> {
    tokio::time::timeout(limit, writes)
        .await
        .unwrap_or_else(|_| {
            Err(ControlError::Timeout {
                operation: format!("command for {}", battery.id),
                after_s: limit.as_secs(),
            })
        })
}

/// Runtime handle for a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    pid_enabled: Arc<watch::Sender<bool>>,
    reports: watch::Receiver<Option<TickReport>>,
}

impl CoordinatorHandle {
    /// Takes effect at the start of the next tick
    pub fn set_pid_enabled(&self, enabled: bool) {
        self.pid_enabled.send_replace(enabled);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TickReport>> {
        self.reports.clone()
    }

    pub fn latest(&self) -> Option<TickReport> {
        self.reports.borrow().clone()
    }
}

/// Owns the control loop: one tick at a time, next tick scheduled only after
/// the previous one has completed.
pub struct Coordinator {
    cfg: Config,
    io: Arc<dyn PointIo>,
    reader: InputReader,
    ctx: ControlContext,
    pid_enabled: Arc<watch::Sender<bool>>,
    reports: watch::Sender<Option<TickReport>>,
}

impl Coordinator {
    pub fn new(cfg: Config, io: Arc<dyn PointIo>) -> Result<Self, ControlError> {
        cfg.check_consistency()?;
        let (pid_tx, _) = watch::channel(cfg.pid.enabled);
        let (reports, _) = watch::channel(None);
        Ok(Self {
            reader: InputReader::from_config(&cfg),
            ctx: ControlContext::new(&cfg),
            pid_enabled: Arc::new(pid_tx),
            reports,
            io,
            cfg,
        })
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            pid_enabled: self.pid_enabled.clone(),
            reports: self.reports.subscribe(),
        }
    }

    pub fn set_pid_enabled(&mut self, enabled: bool) {
        self.pid_enabled.send_replace(enabled);
        self.sync_pid_mode();
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TickReport>> {
        self.reports.subscribe()
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    pub fn slots(&self) -> &[BatterySlot] {
        self.reader.slots()
    }

    fn sync_pid_mode(&mut self) {
        let enabled = *self.pid_enabled.borrow();
        if self.ctx.dispatcher.set_pid_enabled(enabled) {
            info!(mode = %self.ctx.dispatcher.mode(), "dispatch mode changed");
        }
    }

    /// Interval until the next tick. CT mode ticks slower unless the wallbox
    /// is currently restricting the batteries.
    pub fn next_interval(&self) -> Duration {
        let controller = &self.cfg.controller;
        if controller.ct_mode && !self.ctx.wallbox.flags().is_restricting() {
            controller.ct_tick_interval()
        } else {
            controller.tick_interval()
        }
    }

    /// Setpoints hold until the next tick
    fn horizon_s(&self) -> f64 {
        self.next_interval().as_secs_f64()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            batteries = self.reader.slots().len(),
            mode = %self.ctx.dispatcher.mode(),
            ct_mode = self.cfg.controller.ct_mode,
            wallbox = self.ctx.wallbox.is_enabled(),
            "coordinator starting"
        );
        self.startup(Utc::now()).await;

        loop {
            self.tick(Utc::now()).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.next_interval()) => {}
            }
        }

        self.shutdown(Utc::now()).await;
        info!("coordinator stopped");
    }

    /// Clears the command cache and parks every battery at standby. In CT
    /// mode every battery starts under its own regulation instead.
    pub async fn startup(&mut self, now: DateTime<Utc>) {
        self.ctx.gate.clear();
        if self.cfg.controller.ct_mode {
            self.release_all(now).await;
        } else {
            self.standby_all(now).await;
        }
    }

    pub async fn shutdown(&mut self, now: DateTime<Utc>) {
        self.ctx.gate.clear();
        self.standby_all(now).await;
    }

    async fn standby_all(&mut self, now: DateTime<Utc>) -> WriteStats {
        let mut stats = WriteStats::default();
        let explicit = self.cfg.batteries.explicit_mode_control || self.cfg.controller.ct_mode;
        let limit = self.cfg.controller.tick_timeout();
        for slot in self.reader.slots() {
            let writes = self
                .ctx
                .gate
                .apply(&*self.io, &slot.points, BatteryCommand::Standby, explicit, now);
            stats.record(bounded(limit, slot, writes).await, slot);
        }
        stats
    }

    async fn release_all(&mut self, now: DateTime<Utc>) -> WriteStats {
        let mut stats = WriteStats::default();
        let limit = self.cfg.controller.tick_timeout();
        for slot in self.reader.slots() {
            let writes = self.ctx.gate.release(&*self.io, &slot.points, now);
            stats.record(bounded(limit, slot, writes).await, slot);
        }
        stats
    }

    /// Runs one full tick. Returns `None` when the tick was skipped because
    /// the grid reading was unavailable or acquisition timed out.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Option<TickReport> {
        self.sync_pid_mode();

        let timeout = self.cfg.controller.tick_timeout();
        let inputs = match tokio::time::timeout(timeout, self.reader.acquire(&*self.io, now)).await {
            Ok(Ok(inputs)) => inputs,
            Ok(Err(err)) => {
                warn!(error = %err, "skipping control tick");
                return None;
            }
            Err(_) => {
                warn!(timeout_s = timeout.as_secs(), "input acquisition timed out, skipping control tick");
                return None;
            }
        };

        let ct_mode = self.cfg.controller.ct_mode;
        let decision = self.ctx.decide(&inputs, ct_mode, self.horizon_s());
        let stats = if ct_mode {
            self.actuate_ct(&decision, now).await
        } else {
            self.actuate(&decision, now).await
        };

        let report = self.report(&inputs, &decision, stats, now);
        info!(
            grid_w = report.smoothed_grid_w,
            real_power_w = report.real_power_w,
            direction = %report.direction,
            active = %report.active.iter().join(","),
            wallbox = %report.wallbox_phase,
            writes = stats.writes,
            "control tick"
        );
        match serde_json::to_string(&report) {
            Ok(json) => debug!(report = %json, "tick report"),
            Err(err) => debug!(error = %err, "tick report not serialisable"),
        }
        self.reports.send_replace(Some(report.clone()));
        Some(report)
    }

    async fn actuate(&mut self, decision: &Decision, now: DateTime<Utc>) -> WriteStats {
        let mut stats = WriteStats::default();
        let explicit = self.cfg.batteries.explicit_mode_control;
        let limit = self.cfg.controller.tick_timeout();
        for slot in self.reader.slots() {
            let Some(command) = decision.plan.commands.get(&slot.id) else {
                continue;
            };
            let writes = self
                .ctx
                .gate
                .apply(&*self.io, &slot.points, *command, explicit, now);
            stats.record(bounded(limit, slot, writes).await, slot);
        }
        stats
    }

    /// Top-N batteries regulate themselves; the rest are held at standby
    /// under host control. A wallbox block holds all of them.
    async fn actuate_ct(&mut self, decision: &Decision, now: DateTime<Utc>) -> WriteStats {
        let mut stats = WriteStats::default();
        let plan = &decision.plan;
        let hold_all = !decision.flags.allows(plan.direction);
        let limit = self.cfg.controller.tick_timeout();
        for slot in self.reader.slots() {
            if !plan.commands.contains_key(&slot.id) {
                continue;
            }
            if !hold_all && plan.active.contains(&slot.id) {
                let writes = self.ctx.gate.release(&*self.io, &slot.points, now);
                stats.record(bounded(limit, slot, writes).await, slot);
            } else {
                let writes = self
                    .ctx
                    .gate
                    .apply(&*self.io, &slot.points, BatteryCommand::Standby, true, now);
                stats.record(bounded(limit, slot, writes).await, slot);
            }
        }
        stats
    }

    fn report(
        &self,
        inputs: &TickInputs,
        decision: &Decision,
        stats: WriteStats,
        now: DateTime<Utc>,
    ) -> TickReport {
        let plan = &decision.plan;
        TickReport {
            at: now,
            mode: plan.mode,
            ct_mode: self.cfg.controller.ct_mode,
            raw_grid_w: inputs.grid.power_w,
            smoothed_grid_w: decision.grid.value,
            smoothing_window_s: decision.grid.window_seconds,
            real_power_w: decision.real_power_w,
            direction: plan.direction,
            priority: plan.priority.clone(),
            active: plan.active.clone(),
            wallbox_phase: self.ctx.wallbox.phase(),
            flags: decision.flags,
            pid_integral: (plan.mode == DispatchMode::Pid)
                .then(|| self.ctx.dispatcher.pid_state().integral),
            commands: plan.commands.clone(),
            stale_batteries: inputs.stale_units(),
            writes: stats.writes,
            write_failures: stats.failures,
            cache_entries: self.ctx.gate.len(),
        }
    }
}
