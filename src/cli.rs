use std::sync::Arc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use log::{info, warn};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::connection::MusicBike;
use crate::device::signals::Sample;
use crate::device::transport::AllowAll;
use crate::device::types::ConnectionStatus;
use crate::error::AppRunError;

const SETTLE_POLL: u64 = 50;
const DISCONNECT_DEADLINE: u64 = 5_000;

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Client for the Music Bike BLE sensor", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Scan for one scan window and print the Music Bikes that were found
    Scan,
    /// Connect and log status and telemetry until Ctrl-C
    Connect {
        /// Address of the Music Bike; defaults to the configured one, then the first one found
        address: Option<String>,
    },
    /// Connect, zero the accelerometer and disconnect
    Zero {
        /// Address of the Music Bike; defaults to the configured one, then the first one found
        address: Option<String>,
    },
}

async fn start_driver(config: &Config) -> Result<MusicBike, AppRunError> {
    let transport = Arc::new(BtleTransport::new().await?);
    Ok(MusicBike::start(transport, AllowAll, config.driver_settings()).await?)
}

async fn resolve_address(bike: &MusicBike, config: &Config, address: Option<String>) -> Result<String, AppRunError> {
    if let Some(address) = address.or_else(|| config.preferred_address.clone()) {
        return Ok(address);
    }

    let mut found = bike.start_scan();
    let device = found.next().await;
    bike.stop_scan();

    match device {
        Some(device) => {
            info!("Using {} ({})", device.name, device.address);
            Ok(device.address)
        },
        None => Err(AppRunError::NoDevice),
    }
}

async fn wait_until_ready(bike: &MusicBike) -> Result<(), AppRunError> {
    let mut status = bike.status();
    let settled = status.wait_for(|status| {
        matches!(status, ConnectionStatus::Ready | ConnectionStatus::Error(_) | ConnectionStatus::Disconnected)
    }).await.map(|status| status.clone());

    match settled {
        Ok(ConnectionStatus::Ready) => Ok(()),
        Ok(status) => Err(AppRunError::NotReady(status.to_string())),
        Err(_) => Err(AppRunError::NotReady(String::from("driver stopped"))),
    }
}

async fn disconnect(bike: &MusicBike) {
    bike.disconnect();

    let mut status = bike.status();
    let closed = status.wait_for(|status| {
        matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error(_) | ConnectionStatus::Idle)
    });
    if timeout(Duration::from_millis(DISCONNECT_DEADLINE), closed).await.is_err() {
        warn!("Disconnecting took too long");
    }

    bike.shutdown();
}

fn log_sample<T: std::fmt::Display>(name: &str, receiver: &watch::Receiver<Sample<T>>) {
    info!("{}: {}", name, receiver.borrow().value);
}

pub async fn scan(config: &Config) -> Result<(), AppRunError> {
    let bike = start_driver(config).await?;
    let mut found = bike.start_scan();
    let mut count = 0;

    // the stream ends when the scan window elapses
    while let Some(device) = found.next().await {
        println!("{}\t{}", device.address, device.name);
        count += 1;
    }

    let status = bike.current_status();
    bike.shutdown();

    if let ConnectionStatus::Error(reason) = status {
        return Err(AppRunError::NotReady(reason.to_string()));
    }

    info!("Found {} Music Bike(s)", count);
    Ok(())
}

pub async fn connect(config: &Config, address: Option<String>) -> Result<(), AppRunError> {
    let bike = start_driver(config).await?;
    let address = resolve_address(&bike, config, address).await?;

    if !bike.connect(&address) {
        return Err(AppRunError::NotReady(bike.current_status().to_string()));
    }

    let signals = bike.signals();
    let mut status = bike.status();
    let mut speed = signals.speed.subscribe();
    let mut pitch = signals.pitch.subscribe();
    let mut roll = signals.roll.subscribe();
    let mut yaw = signals.yaw.subscribe();
    let mut g_force = signals.g_force.subscribe();
    let mut last_event = signals.last_event.subscribe();
    let mut imu_direction = signals.imu_direction.subscribe();
    let mut hall_direction = signals.hall_direction.subscribe();
    let mut imu_speed_state = signals.imu_speed_state.subscribe();

    let result = 'mainloop: loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break 'mainloop Ok(());
            },
            Ok(_) = status.changed() => {
                let current = status.borrow_and_update().clone();
                info!("{}", current);
                match current {
                    ConnectionStatus::Error(reason) => break 'mainloop Err(AppRunError::NotReady(reason.to_string())),
                    ConnectionStatus::Disconnected => break 'mainloop Ok(()),
                    _ => {},
                }
            },
            Ok(_) = speed.changed() => log_sample("speed", &speed),
            Ok(_) = pitch.changed() => log_sample("pitch", &pitch),
            Ok(_) = roll.changed() => log_sample("roll", &roll),
            Ok(_) = yaw.changed() => log_sample("yaw", &yaw),
            Ok(_) = g_force.changed() => log_sample("g-force", &g_force),
            Ok(_) = last_event.changed() => log_sample("event", &last_event),
            Ok(_) = imu_direction.changed() => log_sample("imu direction", &imu_direction),
            Ok(_) = hall_direction.changed() => log_sample("hall direction", &hall_direction),
            Ok(_) = imu_speed_state.changed() => log_sample("imu speed state", &imu_speed_state),
        }
    };

    disconnect(&bike).await;
    result
}

pub async fn zero(config: &Config, address: Option<String>) -> Result<(), AppRunError> {
    let bike = start_driver(config).await?;
    let address = resolve_address(&bike, config, address).await?;

    if !bike.connect(&address) {
        return Err(AppRunError::NotReady(bike.current_status().to_string()));
    }

    if let Err(err) = wait_until_ready(&bike).await {
        disconnect(&bike).await;
        return Err(err);
    }

    if !bike.zero_accelerometer() {
        disconnect(&bike).await;
        return Err(AppRunError::NotReady(String::from("the accelerometer can not be zeroed")));
    }

    while !bike.is_settled() {
        sleep(Duration::from_millis(SETTLE_POLL)).await;
    }

    info!("Accelerometer zeroed");
    disconnect(&bike).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        let cli = Cli::try_parse_from(["musicbike-ble", "connect", "AA:BB:CC:DD:EE:FF"]).unwrap();
        assert_eq!(cli.command, Command::Connect { address: Some(String::from("AA:BB:CC:DD:EE:FF")) });

        let cli = Cli::try_parse_from(["musicbike-ble", "--log-level", "debug", "zero"]).unwrap();
        assert_eq!(cli.command, Command::Zero { address: None });
        assert_eq!(cli.log_level.as_deref(), Some("debug"));

        assert!(Cli::try_parse_from(["musicbike-ble"]).is_err());
    }
}
