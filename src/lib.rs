use std::env;
use std::sync::Arc;
use futures::StreamExt;
use log::debug;
use tokio::time::{sleep, Duration};
use crate::config::types::Config;
use crate::device::constants::READY_POLL_DELAY;
use crate::device::dispatcher::EventDispatcher;
use crate::device::gateway::Gateway;
use crate::device::session::{ConnectionManager, EventStream};
use crate::device::transport::Transport;
use crate::device::types::ConnectionEvent;
use crate::error::BleError;

pub mod config;
pub mod device;
pub mod error;

pub fn init_logging(config: &Config) {
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
        .level(config.log_level.filter())
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

/// The request and event surfaces over one shared `ConnectionManager`.
pub struct Bridge<T: Transport> {
    pub manager: Arc<ConnectionManager<T>>,
    pub gateway: Gateway<T>,
    pub events: EventDispatcher<T>,
}

impl<T: Transport> Bridge<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let manager = Arc::new(ConnectionManager::new(transport));

        Bridge {
            gateway: Gateway::new(manager.clone()),
            events: EventDispatcher::new(manager.clone()),
            manager,
        }
    }

    /// Waits until `address` has a usable connection handle, for at most `deadline_ms`.
    ///
    /// `events` is only watched for a failure or for its end. A `Connected` item says nothing
    /// about the handle, which may show up before or after it.
    pub async fn wait_until_ready(&self, address: &str, events: &mut EventStream, deadline_ms: u64) -> Result<(), BleError> {
        let deadline = sleep(Duration::from_millis(deadline_ms));
        tokio::pin!(deadline);

        loop {
            match self.manager.registry().lookup_connection(address).await {
                Ok(_) => return Ok(()),
                Err(BleError::NotConnected { .. }) => {},
                Err(err) => return Err(err),
            }

            tokio::select! {
                _ = &mut deadline => {
                    return Err(BleError::NotConnected { address: address.to_string() });
                },
                event = events.next() => match event {
                    Some(ConnectionEvent::StateChange(state)) => debug!("{} is {}", address, state),
                    Some(ConnectionEvent::Failed(err)) => return Err(err),
                    None => return Err(BleError::NotConnected { address: address.to_string() }),
                },
                _ = sleep(Duration::from_millis(READY_POLL_DELAY)) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use super::*;
    use crate::device::testing::MockTransport;
    use crate::device::types::{ConnectionEvent, ConnectionState};

    #[tokio::test]
    async fn disconnect_without_address_ends_every_stream() {
        let transport = Arc::new(MockTransport::new());
        let bridge = Bridge::new(transport.clone());
        let addresses = ["AA:00:00:00:00:01", "AA:00:00:00:00:02", "AA:00:00:00:00:03"];
        let mut streams = vec![];

        for address in addresses {
            transport.add_device(address);
            transport.complete_establish(address);
            let mut events = bridge.events.on_listen(json!({"macAddress": address, "waitForDevice": false})).await;
            transport.emit_state(address, ConnectionState::Connecting);
            assert_eq!(events.next().await, Some(ConnectionEvent::StateChange(ConnectionState::Connecting)));
            streams.push(events);
        }

        assert_eq!(bridge.gateway.call("disconnect", Value::Null).await.unwrap(), Value::Null);

        for mut events in streams {
            assert_eq!(events.next().await, None);
        }
        for address in addresses {
            assert_eq!(bridge.manager.session_generation(address).await, None);
            let err = bridge.gateway.call("readChar", json!({"macAddress": address, "uuid": "00002a37-0000-1000-8000-00805f9b34fb"})).await;
            assert_eq!(err.unwrap_err().code(), "NotConnected");
        }
    }

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    async fn listening_bridge() -> (Arc<MockTransport>, Bridge<MockTransport>, EventStream) {
        let transport = Arc::new(MockTransport::new());
        transport.add_device(ADDRESS);
        let bridge = Bridge::new(transport.clone());
        let events = bridge.events.on_listen(json!({"macAddress": ADDRESS, "waitForDevice": false})).await;
        (transport, bridge, events)
    }

    #[tokio::test]
    async fn ready_without_a_connected_notification() {
        let (transport, bridge, mut events) = listening_bridge().await;

        transport.complete_establish(ADDRESS);

        bridge.wait_until_ready(ADDRESS, &mut events, 1000).await.unwrap();
        assert!(bridge.manager.registry().lookup_connection(ADDRESS).await.is_ok());
    }

    #[tokio::test]
    async fn ready_wait_gives_up_at_the_deadline() {
        let (transport, bridge, mut events) = listening_bridge().await;

        transport.emit_state(ADDRESS, ConnectionState::Connected);

        let err = bridge.wait_until_ready(ADDRESS, &mut events, 50).await.unwrap_err();
        assert_eq!(err, BleError::NotConnected { address: ADDRESS.to_string() });
    }

    #[tokio::test]
    async fn ready_wait_reports_a_failed_attempt() {
        let (transport, bridge, mut events) = listening_bridge().await;

        transport.fail_establish(ADDRESS);
        transport.complete_establish(ADDRESS);

        let err = bridge.wait_until_ready(ADDRESS, &mut events, 1000).await.unwrap_err();
        assert_eq!(err.code(), "TransportFailure");
    }
}
