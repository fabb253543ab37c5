use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use navwatch::config::AppConfig;
use navwatch::format::{format_coordinate, kmh_to_mph};
use navwatch::mqtt::{ConnectionState, MqttHandle, TelemetrySnapshot};
use tokio::sync::watch;
use tracing::{error, info, warn, Level, Subscriber};
use tracing_subscriber::FmtSubscriber;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => AppConfig::default_path()?,
    };
    let config = load_config(&config_path, log_subscriber(Level::INFO)).await?;
    setup_logging_env(config.log_level()?)?;

    info!("Starting navwatch with broker {}", config.broker.address);
    let handle = MqttHandle::spawn(config.mqtt.clone());

    handle
        .connect(&config.broker.address, config.broker.connect_options())
        .map_err(|e| eyre!("Failed to start MQTT connection: {}", e))?;
    for topic in &config.topics {
        if let Err(e) = handle.subscribe(topic) {
            warn!("Skipping topic {:?}: {}", topic, e);
        }
    }

    let state = handle.watch_state();
    tokio::select! {
        _ = report_positions(state) => warn!("Telemetry channel closed"),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
    }

    handle
        .disconnect()
        .map_err(|e| eyre!("Failed to request disconnect: {}", e))?;

    wait_for_disconnect(handle.watch_state(), SHUTDOWN_GRACE).await;

    Ok(())
}

/// Loads the config file while `bootstrap` collects its log events.
async fn load_config<S>(path: &Path, bootstrap: S) -> Result<AppConfig>
where
    S: Subscriber + Send + Sync + 'static,
{
    let _guard = tracing::subscriber::set_default(bootstrap);
    AppConfig::load_or_create(path).await
}

/// Gives the manager `grace` to confirm the disconnect. Returns false if it did not.
async fn wait_for_disconnect(mut state: watch::Receiver<TelemetrySnapshot>, grace: Duration) -> bool {
    let closed = |s: &TelemetrySnapshot| {
        s.connection_state == ConnectionState::Disconnected && s.target.is_none()
    };

    match tokio::time::timeout(grace, state.wait_for(closed)).await {
        Ok(Ok(_)) => {
            info!("Disconnected from broker");
            true
        }
        Ok(Err(_)) => {
            warn!("Connection manager stopped before confirming the disconnect");
            false
        }
        Err(_) => {
            warn!(
                "Session did not close within {} ms, exiting anyway",
                grace.as_millis()
            );
            false
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn log_subscriber(level: Level) -> FmtSubscriber {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish()
}

fn setup_logging_env(level: Level) -> Result<()> {
    tracing::subscriber::set_global_default(log_subscriber(level))
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))
}

/// Console consumer: logs connection changes and every new fix.
async fn report_positions(mut state: watch::Receiver<TelemetrySnapshot>) {
    let mut last_state = ConnectionState::Disconnected;
    let mut last_update = None;

    while state.changed().await.is_ok() {
        let snapshot = state.borrow_and_update().clone();

        if snapshot.connection_state != last_state {
            match &snapshot.connection_error {
                Some(reason) if !snapshot.connected => warn!(
                    "Connection {:?} (attempt {}): {}",
                    snapshot.connection_state, snapshot.reconnect_attempt, reason
                ),
                _ => info!(
                    "Connection {:?} {}",
                    snapshot.connection_state,
                    snapshot.target.as_deref().unwrap_or("")
                ),
            }
            last_state = snapshot.connection_state.clone();
        }

        if snapshot.last_update == last_update {
            continue;
        }
        last_update = snapshot.last_update;

        if let Some(position) = &snapshot.last_position {
            let speed = position
                .speed
                .map(|kmh| format!("{:.1} km/h ({:.1} mph)", kmh, kmh_to_mph(kmh)))
                .unwrap_or_else(|| "-".to_string());
            info!(
                "{} {} {} speed {} device {}",
                position.captured_at.format("%H:%M:%S"),
                format_coordinate(position.latitude, true),
                format_coordinate(position.longitude, false),
                speed,
                position.device_id.as_deref().unwrap_or("unknown"),
            );
        }
    }
}
