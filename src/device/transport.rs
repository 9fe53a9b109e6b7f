use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::ConnectionState;
use crate::error::DeviceError;

/// The bluetooth stack underneath the connection manager.
///
/// A backend does its own scanning and I/O; the connection manager only ever holds the
/// handles it hands out. `establish` and `observe_state_changes` are independent: nothing
/// orders the outcome of one against the items of the other.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// A discovered device.
    type Device: Clone + Send + Sync + 'static;
    /// An established connection to a device.
    type Connection: Clone + Send + Sync + 'static;

    /// Looks up a device that a scan has already discovered.
    async fn resolve_device(&self, address: &str) -> Option<Self::Device>;

    /// Connects to `device`. With `wait_for_device` the attempt keeps going until the device
    /// becomes reachable; otherwise it fails fast. Dropping the future abandons the attempt.
    async fn establish(&self, device: &Self::Device, wait_for_device: bool) -> Result<Self::Connection, DeviceError>;

    /// Drops any link an abandoned `establish` for `device` may have left up. Best effort.
    async fn abort(&self, device: &Self::Device);

    /// Ends a connection returned by `establish`.
    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), DeviceError>;

    /// State changes of `device` from now on, in the order the stack reports them.
    async fn observe_state_changes(&self, device: &Self::Device) -> Result<BoxStream<'static, ConnectionState>, DeviceError>;

    async fn connection_state(&self, device: &Self::Device) -> Result<ConnectionState, DeviceError>;

    async fn read(&self, connection: &Self::Connection, characteristic: Uuid) -> Result<Vec<u8>, DeviceError>;

    /// Writes `value` and returns the bytes that were written.
    async fn write(&self, connection: &Self::Connection, characteristic: Uuid, value: &[u8]) -> Result<Vec<u8>, DeviceError>;

    /// Returns the MTU the peripheral agreed to.
    async fn request_mtu(&self, connection: &Self::Connection, mtu: u16) -> Result<u16, DeviceError>;
}
