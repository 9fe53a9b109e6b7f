use std::future::Future;
use std::pin::Pin;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::STATE_CHANGE_BUFFER;
use crate::device::transport::Transport;
use crate::device::types::ConnectionState;
use crate::error::DeviceError;

type StateChange = (PeripheralId, ConnectionState);

async fn with_deadline<F, R>(operation: &'static str, deadline_ms: u64, fut: F) -> Result<R, DeviceError>
where
    F: Future<Output = Result<R, DeviceError>>,
{
    tokio::select! {
        _ = sleep(Duration::from_millis(deadline_ms)) => {
            warn!("{} took too long", operation);
            Err(DeviceError::Timeout { operation, deadline_ms })
        }
        result = fut => result,
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, DeviceError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or(DeviceError::MissingCharacteristic { uuid })
}

// btleplug only reports connects and disconnects; the other states are sent by establish/disconnect
fn central_events_task(
    cancel: CancellationToken,
    mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    states: broadcast::Sender<StateChange>,
) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.next() => {
                    let change = match event {
                        Some(CentralEvent::DeviceConnected(id)) => (id, ConnectionState::Connected),
                        Some(CentralEvent::DeviceDisconnected(id)) => (id, ConnectionState::Disconnected),
                        Some(_) => continue 'mainloop,
                        None => break 'mainloop,
                    };

                    debug!("Adapter reports {:?} {}", change.0, change.1);
                    // no receivers just means nobody is subscribed right now
                    let _ = states.send(change);
                },
            }
        }
        info!("Adapter event task stopped");
    })
}

/// `Transport` backed by the first bluetooth adapter btleplug finds.
///
/// The connection handle is the peripheral itself; btleplug keeps the link state inside it.
pub struct BtleplugTransport {
    _manager: Manager,
    adapter: Adapter,
    config: Config,
    states: broadcast::Sender<StateChange>,
    cancel: CancellationToken,
}

impl BtleplugTransport {
    pub async fn new(config: Config) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next().ok_or(DeviceError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let (states, _) = broadcast::channel(STATE_CHANGE_BUFFER);
        let cancel = CancellationToken::new();
        central_events_task(cancel.clone(), adapter.events().await?, states.clone());

        Ok(BtleplugTransport { _manager: manager, adapter, config, states, cancel })
    }

    /// Starts the scan that makes devices resolvable.
    pub async fn start_scan(&self) -> Result<(), DeviceError> {
        info!("Scanning...");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<(), DeviceError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    fn announce(&self, peripheral: &Peripheral, state: ConnectionState) {
        let _ = self.states.send((peripheral.id(), state));
    }

    async fn connect_peripheral(&self, peripheral: &Peripheral) -> Result<(), DeviceError> {
        let result = with_deadline("Connect", self.config.connect_deadline, async {
            info!("Connecting to peripheral {}...", peripheral.address());
            peripheral.connect().await?;

            // characteristics are only known after discovery
            debug!("Connected; Discovering services...");
            peripheral.discover_services().await?;
            Ok(())
        }).await;

        // connect() may have gone through even though discovery did not
        if result.is_err() {
            self.drop_link(peripheral).await;
        }
        result
    }

    async fn drop_link(&self, peripheral: &Peripheral) {
        let result = with_deadline("Disconnect", self.config.connect_deadline, async {
            if peripheral.is_connected().await? {
                info!("Dropping half open link to {}", peripheral.address());
                peripheral.disconnect().await?;
            }
            Ok(())
        }).await;

        if let Err(err) = result {
            warn!("Failed to drop the link to {}: {}", peripheral.address(), err);
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Device = Peripheral;
    type Connection = Peripheral;

    async fn resolve_device(&self, address: &str) -> Option<Peripheral> {
        let peripherals = match self.adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                return None;
            },
        };

        peripherals
            .into_iter()
            .find(|peripheral| peripheral.address().to_string().eq_ignore_ascii_case(address))
    }

    async fn establish(&self, device: &Peripheral, wait_for_device: bool) -> Result<Peripheral, DeviceError> {
        loop {
            self.announce(device, ConnectionState::Connecting);

            match self.connect_peripheral(device).await {
                Ok(()) => return Ok(device.clone()),
                Err(err) => {
                    self.announce(device, ConnectionState::Disconnected);
                    if !wait_for_device {
                        return Err(err);
                    }

                    warn!("Connecting to {} failed, retrying: {}", device.address(), err);
                    sleep(Duration::from_millis(self.config.connect_retry_delay)).await;
                },
            }
        }
    }

    async fn abort(&self, device: &Peripheral) {
        self.drop_link(device).await;
        self.announce(device, ConnectionState::Disconnected);
    }

    async fn disconnect(&self, connection: &Peripheral) -> Result<(), DeviceError> {
        self.announce(connection, ConnectionState::Disconnecting);

        with_deadline("Disconnect", self.config.connect_deadline, async {
            connection.disconnect().await?;
            Ok(())
        }).await
    }

    async fn observe_state_changes(&self, device: &Peripheral) -> Result<BoxStream<'static, ConnectionState>, DeviceError> {
        let id = device.id();
        let receiver = self.states.subscribe();

        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let id = id.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((peripheral, state)) if peripheral == id => return Some((state, receiver)),
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("State subscriber fell behind, skipped {} changes", skipped);
                        },
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn connection_state(&self, device: &Peripheral) -> Result<ConnectionState, DeviceError> {
        let connected = with_deadline("Connection state query", self.config.state_query_deadline, async {
            Ok(device.is_connected().await?)
        }).await?;

        Ok(if connected { ConnectionState::Connected } else { ConnectionState::Disconnected })
    }

    async fn read(&self, connection: &Peripheral, characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
        let characteristic = find_characteristic(connection, characteristic)?;

        with_deadline("Read", self.config.operation_deadline, async {
            Ok(connection.read(&characteristic).await?)
        }).await
    }

    async fn write(&self, connection: &Peripheral, characteristic: Uuid, value: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let characteristic = find_characteristic(connection, characteristic)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        with_deadline("Write", self.config.operation_deadline, async {
            connection.write(&characteristic, value, write_type).await?;
            Ok(value.to_vec())
        }).await
    }

    async fn request_mtu(&self, _connection: &Peripheral, _mtu: u16) -> Result<u16, DeviceError> {
        Err(DeviceError::Unsupported { operation: "MTU negotiation" })
    }
}
