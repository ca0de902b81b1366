use anyhow::Result;
use home_battery_arbiter::{config, controller, hardware, telemetry};
use config::Config;
use controller::Coordinator;
use hardware::PointIoFactory;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load()?;
    telemetry::init_tracing(cfg.log_format);

    let factory = PointIoFactory::new(cfg.hardware);
    let site = factory.create(&cfg);
    info!(
        hardware = ?factory.mode(),
        batteries = cfg.batteries.slots().len(),
        "starting home battery arbiter"
    );

    let cancel = CancellationToken::new();
    let signals = telemetry::cancel_on_shutdown(cancel.clone());

    #[cfg(feature = "sim")]
    let sim_task = match &site {
        hardware::factory::Site::Simulated(sim) => {
            Some(spawn_simulation(sim.clone(), cancel.clone()))
        }
        hardware::factory::Site::Mock(_) => None,
    };

    let coordinator = Coordinator::new(cfg, site.io())?;
    coordinator.run(cancel.clone()).await;

    #[cfg(feature = "sim")]
    {
        if let Some(task) = sim_task {
            if let Err(e) = task.await {
                warn!(error = %e, "simulation task failed");
            }
        }
    }
    signals.abort();

    info!("shutdown complete");
    Ok(())
}

/// Steps the simulated site once per second until cancelled
#[cfg(feature = "sim")]
fn spawn_simulation(
    sim: std::sync::Arc<hardware::simulated::SimulatedSite>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let step = std::time::Duration::from_secs(1);
        let mut interval = tokio::time::interval(step);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => sim.advance(step.as_secs_f64(), chrono::Utc::now()),
            }
        }
    })
}
