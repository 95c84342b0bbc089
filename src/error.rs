use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::CharacteristicId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid log level in config file: {0}")]
    InvalidLogLevel(String),
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to initialize logging: {source}")]
    LoggingError { #[from] source: log::SetLoggerError },

    #[error("Failed to open log file: {source}")]
    LogFileError { source: io::Error },

    #[error("No Music Bike found")]
    NoDevice,

    #[error("Music Bike did not become ready: {0}")]
    NotReady(String),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("No bluetooth adapter available")]
    NoAdapter,

    #[error("Peripheral {0} has not been seen by the adapter")]
    UnknownPeripheral(String),
}

impl DeviceError {
    pub fn is_permission_error(&self) -> bool {
        matches!(self, DeviceError::Btle { source: btleplug::Error::PermissionDenied })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{id} payload must be {expected} bytes, got {actual}")]
    WrongLength { id: CharacteristicId, expected: usize, actual: usize },

    #[error("{id} payload is empty")]
    Empty { id: CharacteristicId },

    #[error("{id} is not a notify characteristic")]
    NotNotifiable { id: CharacteristicId },
}
