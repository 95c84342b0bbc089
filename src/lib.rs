use std::env;
use crate::cli::{Cli, Command};
use crate::config::types::Config;
use crate::error::AppRunError;

pub mod cli;
pub mod config;
pub mod device;
pub mod error;

pub fn init_logging(level: log::LevelFilter) -> Result<(), AppRunError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).map_err(|source| AppRunError::LogFileError { source })?
        );
    }

    dispatch.apply()?;
    Ok(())
}

pub async fn run(cli: Cli, config: Config) -> Result<(), AppRunError> {
    match cli.command {
        Command::Scan => cli::scan(&config).await,
        Command::Connect { address } => cli::connect(&config, address).await,
        Command::Zero { address } => cli::zero(&config, address).await,
    }
}
