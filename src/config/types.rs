use serde::{Deserialize, Serialize};

use crate::device::constants::{CONNECT_DEADLINE, CONNECT_DELAY, IS_CONNECTED_DEADLINE, SCAN_DURATION, WRITE_DEADLINE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Timing knobs for the bluetooth backend, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub log_level: LogLevel,
    /// How long the command line tool scans before resolving an address.
    pub scan_duration: u64,
    /// Pause between attempts when an attempt waits for the device.
    pub connect_retry_delay: u64,
    pub connect_deadline: u64,
    /// Deadline for a single characteristic read or write.
    pub operation_deadline: u64,
    pub state_query_deadline: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LogLevel::Info,
            scan_duration: SCAN_DURATION,
            connect_retry_delay: CONNECT_DELAY,
            connect_deadline: CONNECT_DEADLINE,
            operation_deadline: WRITE_DEADLINE,
            state_query_deadline: IS_CONNECTED_DEADLINE,
        }
    }
}
