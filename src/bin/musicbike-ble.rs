use std::str::FromStr;
use clap::Parser;
use log::info;
use musicbike_ble::{init_logging, run};
use musicbike_ble::cli::Cli;
use musicbike_ble::config::io::ConfigIO;
use musicbike_ble::error::{AppRunError, ConfigError};

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();

    let config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    let _guard = match locker.lock() {
        Ok(guard) => guard,
        Err(err @ ConfigError::CanNotLock { .. }) => {
            eprintln!("musicbike-ble is already running");
            return Err(err.into());
        },
        Err(err) => return Err(err.into()),
    };

    let config = config_io.read().await?;
    let level = match &cli.log_level {
        Some(level) => log::LevelFilter::from_str(level)
            .map_err(|_| ConfigError::InvalidLogLevel(level.clone()))?,
        None => config.log_level()?,
    };

    init_logging(level)?;
    info!(concat!("Music Bike BLE ", env!("CARGO_PKG_VERSION")));

    run(cli, config).await
}
