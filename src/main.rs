use std::env;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use neurostream::config::CoreConfig;
use neurostream::context::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CoreConfig::from_env().context("loading configuration")?;
    info!("neurostream core starting");

    let ctx = match env::var("NS_TRANSPORT").as_deref() {
        Ok("sim") => {
            info!("using simulated transport");
            AppContext::build_simulated(config)?
        }
        _ => AppContext::build(config)?,
    };

    let target = match env::var("NS_DEVICE") {
        Ok(target) => target,
        Err(_) => {
            info!("no NS_DEVICE set, scanning only");
            let devices = ctx.scan_devices().await?;
            if devices.is_empty() {
                info!("no devices found");
            }
            for device in devices {
                info!(
                    "  {} ({}) rssi={:?}",
                    device.name, device.address, device.rssi
                );
            }
            ctx.shutdown().await;
            return Ok(());
        }
    };

    let device = ctx.connect_device(&target).await?;
    info!("connected to {} ({})", device.name, device.address);
    ctx.start_streaming().await?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("signal handler failed: {}", e);
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                let status = ctx.status();
                let samples: u64 = status.sensors.iter().map(|s| s.samples).sum();
                let errors: u64 = status.sensors.iter().map(|s| s.decode_errors).sum();
                info!(
                    "phase={:?} samples={} decode_errors={} battery={:?}",
                    status.monitor.phase,
                    samples,
                    errors,
                    status.device.and_then(|d| d.battery_percent),
                );
            }
        }
    }

    ctx.shutdown().await;
    info!("bye");
    Ok(())
}
