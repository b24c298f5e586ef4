use clap::Parser;
use serial_discovery::config::ConfigLoader;
use serial_discovery::{
    logging, DiscoveryController, DiscoveryEvent, PollingSourceFactory, TokioPortOpener,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Discovers serial devices, validates them and reports the supported ones.",
    long_about = "Watches the platform's serial ports, probes every new device against the configured identification rules and logs the validated device list after each enumeration sweep. SIGTSTP suspends discovery and SIGCONT resumes it."
)]
struct Args {
    /// Configuration file. Defaults to the standard search locations.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device selector to watch (all, usb, pci, bluetooth, name:<prefix>).
    /// Repeat for several; replaces the configured list.
    #[arg(short, long = "selector")]
    selectors: Vec<String>,

    /// Log level, overridden by RUST_LOG.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Exit after the first enumeration sweep.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut loader = match &args.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    if !args.selectors.is_empty() {
        loader.config_mut().discovery.selectors = args.selectors.clone();
    }
    if let Some(level) = args.log_level.clone() {
        loader.config_mut().logging.level = level;
    }
    let config_path = loader.config_path.clone();
    let config = loader.into_config();
    config.validate()?;

    logging::init(&config.logging);
    info!(
        config = ?config_path,
        selectors = ?config.discovery.selectors,
        "Starting serial discovery"
    );

    let factory = Arc::new(PollingSourceFactory::new(config.discovery.poll_interval()));
    let controller =
        DiscoveryController::new(&config, factory, Arc::new(TokioPortOpener::new()));
    let mut events = controller.subscribe();
    controller.start()?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lifecycle = LifecycleSignals::new()?;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            change = lifecycle.next() => match change {
                Lifecycle::Suspend => {
                    controller.app_suspending();
                }
                Lifecycle::Resume => {
                    controller.app_resumed();
                }
            },
            event = events.recv() => match event {
                Ok(DiscoveryEvent::EnumerationCompleted { sweep, .. }) => {
                    log_devices(&controller, sweep);
                    if args.once {
                        break;
                    }
                }
                Ok(DiscoveryEvent::DeviceArrived(device)) => {
                    debug!(device = %device.id, "Arrival reported");
                }
                Ok(DiscoveryEvent::DeviceDeparted(id)) => {
                    debug!(device = %id, "Departure reported");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Discovery events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    controller.stop();
    Ok(())
}

fn log_devices(controller: &DiscoveryController, sweep: u64) {
    let devices = controller.list_devices();
    if devices.is_empty() {
        info!(sweep, "No supported devices found");
        return;
    }
    for device in devices {
        info!(
            sweep,
            device = %device.id,
            description = device.description.as_deref().unwrap_or_default(),
            departing = device.departing,
            "Device"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

enum Lifecycle {
    Suspend,
    Resume,
}

/// SIGTSTP / SIGCONT stand in for the host application's lifecycle calls.
#[cfg(unix)]
struct LifecycleSignals {
    suspend: tokio::signal::unix::Signal,
    resume: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl LifecycleSignals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            suspend: signal(SignalKind::from_raw(libc::SIGTSTP))?,
            resume: signal(SignalKind::from_raw(libc::SIGCONT))?,
        })
    }

    async fn next(&mut self) -> Lifecycle {
        tokio::select! {
            _ = self.suspend.recv() => Lifecycle::Suspend,
            _ = self.resume.recv() => Lifecycle::Resume,
        }
    }
}

#[cfg(not(unix))]
struct LifecycleSignals;

#[cfg(not(unix))]
impl LifecycleSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Lifecycle {
        std::future::pending().await
    }
}
