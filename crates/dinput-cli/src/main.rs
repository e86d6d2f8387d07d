//! dinput CLI: inspect, capture and route local input devices.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dinput_daemon::config::Config;
use dinput_daemon::{ChannelTransport, Daemon, DaemonEvent, DeviceMonitor, InputCollector};
use dinput_input::{
    DInputState, HubMode, InputBackend, InputHub, ScreenRegistry, TouchRemapper, UinputBackend,
};
use dinput_types::{InputDevice, InputDeviceEvent, InputTypes, RawEvent};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "dinput",
    about = "Capture, share and replay input devices across machines",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List input devices with their descriptor and classes.
    List,

    /// Print devices as they are plugged in and removed.
    Monitor,

    /// Print raw events of shared devices.
    Capture {
        /// Descriptors of the devices to share.
        #[arg(long, num_args = 1.., conflicts_with = "all")]
        share: Vec<String>,

        /// Share every device.
        #[arg(long)]
        all: bool,
    },

    /// Run the daemon, forwarding to itself through virtual devices.
    Start,
}

#[cfg(feature = "linux")]
fn backends() -> anyhow::Result<(Arc<dyn InputBackend>, Arc<dyn UinputBackend>)> {
    use dinput_input::linux::{EvdevBackend, UinputDeviceBackend};
    Ok((
        Arc::new(EvdevBackend::new()),
        Arc::new(UinputDeviceBackend::new()),
    ))
}

#[cfg(not(feature = "linux"))]
fn backends() -> anyhow::Result<(Arc<dyn InputBackend>, Arc<dyn UinputBackend>)> {
    anyhow::bail!("dinput was built without the linux backend")
}

fn hub(config: &Config, mode: HubMode, backend: Arc<dyn InputBackend>) -> anyhow::Result<InputHub> {
    Ok(InputHub::new(
        mode,
        config.hub.to_hub_config(),
        backend,
        Arc::new(DInputState::new()),
        TouchRemapper::new(Arc::new(ScreenRegistry::new())),
    )?)
}

fn print_device(device: &InputDevice, path: &str) {
    println!(
        "{path}\t{}\t{:?}\t{}",
        device.descriptor,
        device.classes(),
        device.name
    );
}

fn print_event(event: &RawEvent) {
    println!(
        "{} {} {} type={:#04x} code={:#05x} value={}",
        event.when, event.path, event.descriptor, event.event_type, event.code, event.value
    );
}

fn list(config: &Config) -> anyhow::Result<()> {
    let (backend, _) = backends()?;
    let hub = hub(config, HubMode::EventCollection, backend)?;
    let devices = hub.scan_input_devices(&config.hub.device_dir);
    let descriptors: Vec<String> = devices.iter().map(|d| d.descriptor.clone()).collect();
    let paths = hub.get_device_paths_by_dh_ids(&descriptors);
    for device in &devices {
        let path = paths.get(&device.descriptor).map_or("?", String::as_str);
        print_device(device, path);
    }
    let skipped = hub.get_skip_device_paths();
    if !skipped.is_empty() {
        println!("skipped: {}", skipped.len());
    }
    Ok(())
}

async fn monitor(config: &Config) -> anyhow::Result<()> {
    let (backend, _) = backends()?;
    let monitor = DeviceMonitor::new(hub(config, HubMode::PluginMonitor, backend)?)?;
    let (tx, mut rx) = mpsc::channel(config.daemon.channel_capacity.max(1));
    monitor.start(tx)?;

    loop {
        tokio::select! {
            change = rx.recv() => match change {
                Some(InputDeviceEvent::Added(device)) => print_device(&device, "added"),
                Some(InputDeviceEvent::Removed(device)) => print_device(&device, "removed"),
                Some(InputDeviceEvent::ScanFinished) => println!("scan finished"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(rx);
    tokio::task::spawn_blocking(move || monitor.stop()).await?;
    Ok(())
}

async fn capture(config: &Config, share: Vec<String>, all: bool) -> anyhow::Result<()> {
    let (backend, _) = backends()?;
    let collector = InputCollector::new(hub(config, HubMode::EventCollection, backend)?)?;
    collector
        .hub()
        .scan_input_devices(&config.hub.device_dir);
    let affected = if all {
        collector.set_sharing_types(true, InputTypes::all())
    } else {
        collector.set_sharing_dh_ids(true, &share)
    };
    if affected.sharing_dh_ids.is_empty() {
        anyhow::bail!("no device to capture; pass --all or descriptors from `dinput list`");
    }
    tracing::info!(devices = ?affected.sharing_dh_ids, "capturing");

    let (tx, mut rx) = mpsc::channel(config.daemon.channel_capacity.max(1));
    collector.start(tx, config.hub.event_buffer_size)?;

    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => batch.iter().for_each(print_event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(rx);
    tokio::task::spawn_blocking(move || collector.stop()).await?;
    Ok(())
}

async fn start(config: Config) -> anyhow::Result<()> {
    let (backend, uinput) = backends()?;
    let network_id = config.daemon.network_id.clone();
    let transport = Arc::new(ChannelTransport::loopback(
        &network_id,
        config.daemon.channel_capacity.max(1),
    ));
    let mut daemon = Daemon::new(config, backend, Some(uinput), transport)?;
    let events = daemon.event_sender();

    tokio::spawn(async move {
        let _ = events.send(DaemonEvent::Connect(network_id)).await;
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(DaemonEvent::Shutdown).await;
        }
    });

    daemon.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = dinput_daemon::setup::load_config(cli.config.as_deref())
        .context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.daemon.log_level)),
        )
        .init();

    match cli.command {
        Commands::List => list(&config),
        Commands::Monitor => monitor(&config).await,
        Commands::Capture { share, all } => capture(&config, share, all).await,
        Commands::Start => {
            tracing::info!(network_id = %config.daemon.network_id, "starting dinput daemon");
            start(config).await
        }
    }
}
