use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Request failed: {source}")]
    BleError { #[from] source: BleError },
}

/// Failures reported by a transport backend.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Bluetooth characteristic {uuid} is not available on this device")]
    MissingCharacteristic { uuid: Uuid },

    #[error("{operation} did not complete within {deadline_ms} ms")]
    Timeout { operation: &'static str, deadline_ms: u64 },

    #[error("{operation} is not supported by this bluetooth backend")]
    Unsupported { operation: &'static str },

    #[error("The connection to the device was lost")]
    LinkLost,
}

/// The error taxonomy seen by callers of the gateway and by event subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error(
        "Device {address} has not been initialized yet. \
        It must be discovered by a scan before the device can be accessed"
    )]
    NotInitialized { address: String },

    #[error(
        "Connection to device {address} has not been established yet. \
        Connect and wait for the connected state before doing any read/write operation"
    )]
    NotConnected { address: String },

    #[error("Bluetooth operation failed: {detail}")]
    TransportFailure { detail: String },

    #[error("Invalid argument: {detail}")]
    InvalidArgument { detail: String },
}

impl BleError {
    /// Stable name of the error kind, used at the RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            BleError::NotInitialized { .. } => "NotInitialized",
            BleError::NotConnected { .. } => "NotConnected",
            BleError::TransportFailure { .. } => "TransportFailure",
            BleError::InvalidArgument { .. } => "InvalidArgument",
        }
    }
}

impl From<DeviceError> for BleError {
    fn from(err: DeviceError) -> Self {
        BleError::TransportFailure { detail: err.to_string() }
    }
}

impl From<serde_json::Error> for BleError {
    fn from(err: serde_json::Error) -> Self {
        BleError::InvalidArgument { detail: err.to_string() }
    }
}

impl From<uuid::Error> for BleError {
    fn from(err: uuid::Error) -> Self {
        BleError::InvalidArgument { detail: format!("malformed characteristic uuid: {}", err) }
    }
}
