//! In-memory transport for unit tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::device::constants::MIN_MTU;
use crate::device::transport::Transport;
use crate::device::types::ConnectionState;
use crate::error::DeviceError;

/// Largest MTU the simulated peripherals agree to.
pub const PERIPHERAL_MTU: u16 = 247;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConnection {
    pub address: String,
    pub id: u64,
}

#[derive(Default)]
struct MockState {
    devices: HashSet<String>,
    gates: HashMap<String, Arc<Semaphore>>,
    failing: HashSet<String>,
    observers: HashMap<String, Vec<UnboundedSender<ConnectionState>>>,
    live: HashMap<u64, String>,
    established: HashMap<String, usize>,
    values: HashMap<Uuid, Vec<u8>>,
    fail_next_operation: bool,
    next_id: u64,
    on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl MockState {
    fn gate(&mut self, address: &str) -> Arc<Semaphore> {
        self.gates
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    fn check_operation(&mut self, connection: &MockConnection, operation: &'static str) -> Result<(), DeviceError> {
        if !self.live.contains_key(&connection.id) {
            return Err(DeviceError::LinkLost);
        }
        if self.fail_next_operation {
            self.fail_next_operation = false;
            return Err(DeviceError::Timeout { operation, deadline_ms: 0 });
        }
        Ok(())
    }
}

/// Connection attempts block until the test calls `complete_establish` for the address.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    establish_calls: AtomicUsize,
    observe_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    abort_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("Failed to lock mock state")
    }

    pub fn add_device(&self, address: &str) {
        self.state().devices.insert(address.to_string());
    }

    pub fn remove_device(&self, address: &str) {
        self.state().devices.remove(address);
    }

    /// Lets one pending or future connection attempt for `address` finish.
    pub fn complete_establish(&self, address: &str) {
        self.state().gate(address).add_permits(1);
    }

    /// Makes connection attempts for `address` fail once they are completed.
    pub fn fail_establish(&self, address: &str) {
        self.state().failing.insert(address.to_string());
    }

    /// Runs `hook` whenever a connection attempt is about to succeed.
    pub fn on_complete(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state().on_complete = Some(Arc::new(hook));
    }

    pub fn emit_state(&self, address: &str, state: ConnectionState) {
        if let Some(observers) = self.state().observers.get_mut(address) {
            observers.retain(|observer| observer.unbounded_send(state).is_ok());
        }
    }

    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.state().values.insert(characteristic, value.to_vec());
    }

    pub fn value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.state().values.get(&characteristic).cloned()
    }

    pub fn fail_next_operation(&self) {
        self.state().fail_next_operation = true;
    }

    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    pub fn observe_calls(&self) -> usize {
        self.observe_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    /// How many attempts for `address` produced a connection.
    pub fn established_count(&self, address: &str) -> usize {
        self.state().established.get(address).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Device = String;
    type Connection = MockConnection;

    async fn resolve_device(&self, address: &str) -> Option<String> {
        self.state().devices.get(address).cloned()
    }

    async fn establish(&self, device: &String, _wait_for_device: bool) -> Result<MockConnection, DeviceError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.state().gate(device);
        gate.acquire().await.map_err(|_| DeviceError::LinkLost)?.forget();

        let hook = self.state().on_complete.clone();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.state();
        if state.failing.contains(device) {
            return Err(DeviceError::Timeout { operation: "Connect", deadline_ms: 0 });
        }

        state.next_id += 1;
        let connection = MockConnection { address: device.clone(), id: state.next_id };
        state.live.insert(connection.id, device.clone());
        *state.established.entry(device.clone()).or_insert(0) += 1;
        Ok(connection)
    }

    async fn abort(&self, _device: &String) {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnect(&self, connection: &MockConnection) -> Result<(), DeviceError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.state().live.remove(&connection.id);
        Ok(())
    }

    async fn observe_state_changes(&self, device: &String) -> Result<BoxStream<'static, ConnectionState>, DeviceError> {
        self.observe_calls.fetch_add(1, Ordering::SeqCst);

        let (sender, receiver) = unbounded();
        self.state().observers.entry(device.clone()).or_default().push(sender);
        Ok(receiver.boxed())
    }

    async fn connection_state(&self, device: &String) -> Result<ConnectionState, DeviceError> {
        let connected = self.state().live.values().any(|address| address == device);
        Ok(if connected { ConnectionState::Connected } else { ConnectionState::Disconnected })
    }

    async fn read(&self, connection: &MockConnection, characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.state();
        state.check_operation(connection, "Read")?;
        state.values
            .get(&characteristic)
            .cloned()
            .ok_or(DeviceError::MissingCharacteristic { uuid: characteristic })
    }

    async fn write(&self, connection: &MockConnection, characteristic: Uuid, value: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.state();
        state.check_operation(connection, "Write")?;
        state.values.insert(characteristic, value.to_vec());
        Ok(value.to_vec())
    }

    async fn request_mtu(&self, connection: &MockConnection, mtu: u16) -> Result<u16, DeviceError> {
        self.state().check_operation(connection, "MTU request")?;
        Ok(mtu.clamp(MIN_MTU, PERIPHERAL_MTU))
    }
}

/// Polls `check` until it holds, giving up after about a second.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}
