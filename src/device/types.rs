use std::fmt;

use crate::error::BleError;

/// Connection state of a peripheral as reported by the transport.
///
/// The discriminants are the ordinals sent over the event boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Disconnecting => "disconnecting",
        };

        write!(f, "{}", result)
    }
}

/// An item on a device's event stream.
///
/// `Failed` is always the last item; the stream ends right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChange(ConnectionState),
    Failed(BleError),
}
