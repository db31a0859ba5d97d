use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use zerogrid::Config;
use zerogrid::context::{DeviceContext, LocalActuators};
use zerogrid::controller::{Actuators, PowerBalanceController};
use zerogrid::logging::init_logging;
use zerogrid::meter::MeterReader;
use zerogrid::rpc::{CommandDispatcher, HealthMonitor, RemoteActuators, RpcClient};
use zerogrid::safety::SafetySupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(explicit.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    info!("Zerogrid {} starting up", env!("CARGO_PKG_VERSION"));

    let ctx = DeviceContext::new(&config);
    let cancel = ctx.shutdown.clone();
    let mut tasks = tokio::task::JoinSet::new();

    let local_devices = config.controller.remote.is_none() || config.rpc.enabled;

    if local_devices {
        let inverter_ctx = ctx.clone();
        let backoff = config.inverter.reconnect_backoff();
        let start_power = config.inverter.start_power;
        tasks.spawn(async move {
            if let Err(e) = inverter_ctx.connect_inverter(backoff, start_power).await {
                warn!("Inverter connect abandoned: {}", e);
            }
        });

        let charger_ctx = ctx.clone();
        let backoff = config.charger.reconnect_backoff();
        tasks.spawn(async move {
            if let Err(e) = charger_ctx.connect_charger(backoff).await {
                warn!("Charger connect abandoned: {}", e);
            }
        });

        let monitor = HealthMonitor::new(
            ctx.charger.clone(),
            ctx.charger_health.clone(),
            config.rpc.health_interval(),
        )
        .with_inverter(ctx.inverter.clone(), ctx.inverter_health.clone());
        tasks.spawn(monitor.run(cancel.clone()));
    }

    if config.rpc.enabled {
        let dispatcher = Arc::new(CommandDispatcher::new(ctx.clone(), &config.rpc));
        let token = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = dispatcher.run(token).await {
                error!("Command server error: {}", e);
            }
        });
    }

    if config.controller.enabled {
        let actuators: Box<dyn Actuators> = match &config.controller.remote {
            Some(address) => Box::new(RemoteActuators::new(RpcClient::new(
                address.clone(),
                config.rpc.request_timeout(),
            ))),
            None => Box::new(LocalActuators::new(&ctx)),
        };
        let mut controller = PowerBalanceController::new(
            &config.controller,
            config.inverter.max_power,
            Box::new(MeterReader::new(&config.meter)),
            actuators,
        );
        if let Err(e) = controller.open_log() {
            warn!("Cycle log disabled: {}", e);
        }
        let supervisor = SafetySupervisor::new(controller, &config.controller);
        tasks.spawn(supervisor.run(cancel.clone()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();

    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!("Task failed during shutdown: {}", e);
        }
    }

    if local_devices {
        if let Err(e) = ctx.force_safe().await {
            warn!("Final zeroing incomplete: {}", e);
        }
        if let Err(e) = ctx.inverter.lock().await.shutdown().await {
            warn!("Inverter shutdown: {}", e);
        }
        ctx.charger.lock().await.disconnect();
    }

    info!("Shutdown complete");
    Ok(())
}
