use std::sync::Arc;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::device::session::{ConnectionManager, EventSink, EventStream};
use crate::device::transport::Transport;
use crate::error::BleError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenArgs {
    mac_address: String,
    wait_for_device: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelArgs {
    mac_address: String,
}

/// Ties the per device event streams to the lifetime of connection sessions.
pub struct EventDispatcher<T: Transport> {
    manager: Arc<ConnectionManager<T>>,
}

impl<T: Transport> Clone for EventDispatcher<T> {
    fn clone(&self) -> Self {
        EventDispatcher { manager: self.manager.clone() }
    }
}

impl<T: Transport> EventDispatcher<T> {
    pub fn new(manager: Arc<ConnectionManager<T>>) -> Self {
        EventDispatcher { manager }
    }

    /// Opens an event stream for `{macAddress, waitForDevice}`.
    ///
    /// Opening never fails: bad arguments and connection failures arrive as the stream's
    /// terminal item.
    pub async fn on_listen(&self, args: Value) -> EventStream {
        let (sink, events) = EventSink::channel();

        match serde_json::from_value::<ListenArgs>(args) {
            Ok(args) => self.listen(&args.mac_address, args.wait_for_device, sink).await,
            Err(err) => {
                warn!("Rejected event subscription: {}", err);
                sink.fail(BleError::from(err));
            },
        }

        events
    }

    /// Typed form of `on_listen`.
    pub async fn listen(&self, address: &str, wait_for_device: bool, sink: EventSink) {
        info!("Subscriber attached to {}", address);
        self.manager.connect(address, wait_for_device, sink).await;
    }

    /// The subscriber went away; same as disconnecting the address.
    pub async fn on_cancel(&self, args: Value) -> Result<(), BleError> {
        let args: CancelArgs = serde_json::from_value(args)?;
        self.cancel(&args.mac_address).await;
        Ok(())
    }

    /// Returns whether this call released the session.
    pub async fn cancel(&self, address: &str) -> bool {
        info!("Subscriber of {} cancelled", address);
        self.manager.disconnect(address).await
    }
}
