//! Connection sessions: one connection attempt, its state feed and its event sink per device.
//!
//! A session owns two tasks. The establish task asks the transport for a connection, stores
//! the handle on success and ends the connection once the session is released. The state task
//! forwards the transport's state changes to the sink. The two run independently, so a
//! `Connected` state change may reach the subscriber before or after the handle becomes usable;
//! only an operation failing with `NotConnected` tells a caller the handle is not there yet.

use std::sync::{Arc, Mutex, MutexGuard};
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::registry::{DeviceRegistry, SharedSlot};
use crate::device::transport::Transport;
use crate::device::types::{ConnectionEvent, ConnectionState};
use crate::error::BleError;

pub type EventStream = UnboundedReceiver<ConnectionEvent>;

/// Sending half of a device's event stream.
///
/// Clones share one sender, so once `fail` or `end_of_stream` took it no clone can send again.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Arc<Mutex<Option<UnboundedSender<ConnectionEvent>>>>,
}

impl EventSink {
    pub fn channel() -> (EventSink, EventStream) {
        let (sender, receiver) = unbounded();
        (EventSink { sender: Arc::new(Mutex::new(Some(sender))) }, receiver)
    }

    fn sender(&self) -> MutexGuard<'_, Option<UnboundedSender<ConnectionEvent>>> {
        self.sender.lock().expect("Failed to lock event sink")
    }

    /// Returns false once the stream has ended.
    pub fn send_state(&self, state: ConnectionState) -> bool {
        match self.sender().as_ref() {
            Some(sender) => sender.unbounded_send(ConnectionEvent::StateChange(state)).is_ok(),
            None => false,
        }
    }

    /// Delivers `err` as the last item and ends the stream.
    pub fn fail(&self, err: BleError) {
        let sender = match self.sender().take() {
            Some(sender) => sender,
            None => {
                debug!("Dropped error for a closed event stream");
                return;
            },
        };

        if sender.unbounded_send(ConnectionEvent::Failed(err)).is_err() {
            debug!("Dropped error for a closed event stream");
        }
        sender.close_channel();
    }

    pub fn end_of_stream(&self) {
        if let Some(sender) = self.sender().take() {
            sender.close_channel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender().as_ref().map_or(true, |sender| sender.is_closed())
    }
}

/// The live resources of one connection attempt.
pub struct Session {
    generation: u64,
    establish_cancel: CancellationToken,
    establish_task: JoinHandle<()>,
    state_cancel: CancellationToken,
    state_task: JoinHandle<()>,
    sink: EventSink,
}

impl Session {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancels both tasks, waits until they have stopped and ends the event stream.
    pub async fn close(self) {
        self.establish_cancel.cancel();
        self.state_cancel.cancel();

        if let Err(err) = self.establish_task.await {
            warn!("Establish task of session {} did not stop cleanly: {:?}", self.generation, err);
        }
        if let Err(err) = self.state_task.await {
            warn!("State task of session {} did not stop cleanly: {:?}", self.generation, err);
        }

        self.sink.end_of_stream();
    }
}

fn establish_task<T: Transport>(
    cancel: CancellationToken,
    transport: Arc<T>,
    device: T::Device,
    wait_for_device: bool,
    slot: SharedSlot<T::Connection>,
    generation: u64,
    sink: EventSink,
) -> JoinHandle<()> {
    spawn(async move {
        let connection = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Connection attempt {} cancelled before it completed", generation);
                transport.abort(&device).await;
                return;
            },
            result = transport.establish(&device, wait_for_device) => match result {
                Ok(connection) => connection,
                Err(err) => {
                    warn!("Connection attempt {} failed: {}", generation, err);
                    sink.fail(err.into());
                    return;
                },
            },
        };

        let stored = slot.lock().expect("Failed to lock connection slot").store(generation, connection.clone());
        if stored {
            info!("Connection {} established", generation);
            cancel.cancelled().await;
        } else {
            debug!("Discarding connection from released session {}", generation);
        }

        if let Err(err) = transport.disconnect(&connection).await {
            warn!("Failed to end connection {}: {}", generation, err);
        }
    })
}

fn state_task(
    cancel: CancellationToken,
    mut states: BoxStream<'static, ConnectionState>,
    sink: EventSink,
) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                state = states.next() => match state {
                    Some(state) => {
                        if !sink.send_state(state) {
                            break 'mainloop;
                        }
                    },
                    None => break 'mainloop,
                },
            }
        }
    })
}

/// Process wide connection state, shared by the operation gateway and the event dispatcher.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    registry: DeviceRegistry<T>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let registry = DeviceRegistry::new(transport.clone());
        ConnectionManager { transport, registry }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn registry(&self) -> &DeviceRegistry<T> {
        &self.registry
    }

    /// Opens a session for `address`, replacing any session that was already open.
    ///
    /// Returns as soon as both subscriptions are registered. Failures, including an unknown
    /// device, are delivered on `sink`.
    pub async fn connect(&self, address: &str, wait_for_device: bool, sink: EventSink) {
        let record = self.registry.get_or_create(address);
        let mut record = record.lock().await;

        if record.release_session().await {
            info!("Replaced the previous session for {}", address);
        }

        let device = match self.registry.resolve_device(&mut record).await {
            Ok(device) => device,
            Err(err) => {
                warn!("Can not connect to {}: {}", address, err);
                sink.fail(err);
                return;
            },
        };

        let states = match self.transport.observe_state_changes(&device).await {
            Ok(states) => states,
            Err(err) => {
                warn!("Can not observe state changes of {}: {}", address, err);
                sink.fail(err.into());
                return;
            },
        };

        let generation = record.connection.lock().expect("Failed to lock connection slot").advance();
        info!("Connecting to {} (session {}, wait for device: {})", address, generation, wait_for_device);

        let establish_cancel = CancellationToken::new();
        let establish_task = establish_task(
            establish_cancel.clone(),
            self.transport.clone(),
            device,
            wait_for_device,
            record.connection.clone(),
            generation,
            sink.clone(),
        );
        let state_cancel = CancellationToken::new();
        let state_task = state_task(state_cancel.clone(), states, sink.clone());

        record.session = Some(Session {
            generation,
            establish_cancel,
            establish_task,
            state_cancel,
            state_task,
            sink,
        });
    }

    /// Releases the session for `address`. Returns whether there was a session to release;
    /// calling this for an address without a session is a successful no-op.
    pub async fn disconnect(&self, address: &str) -> bool {
        let record = self.registry.get_or_create(address);
        let released = record.lock().await.release_session().await;

        if released {
            info!("Disconnected {}", address);
        } else {
            debug!("Nothing to disconnect for {}", address);
        }
        released
    }

    /// Releases every session. Returns how many there were.
    pub async fn disconnect_all(&self) -> usize {
        let mut released = 0;
        for address in self.registry.addresses() {
            if self.disconnect(&address).await {
                released += 1;
            }
        }
        released
    }

    /// Generation of the live session for `address`, if there is one.
    pub async fn session_generation(&self, address: &str) -> Option<u64> {
        let record = self.registry.get_or_create(address);
        let record = record.lock().await;
        record.session.as_ref().map(|session| session.generation())
    }
}
