use std::sync::{Arc, Mutex};
use indexmap::IndexMap;
use log::debug;
use tokio::sync::Mutex as AsyncMutex;

use crate::device::session::Session;
use crate::device::transport::Transport;
use crate::error::BleError;

/// Holds the connection handle of one device, tagged with the session generation that owns it.
///
/// Every new session and every teardown advances the generation, so a completion from a
/// session that is already gone can never land in the slot.
#[derive(Debug)]
pub struct ConnectionSlot<C> {
    generation: u64,
    connection: Option<C>,
}

impl<C: Clone> ConnectionSlot<C> {
    pub fn new() -> Self {
        ConnectionSlot { generation: 0, connection: None }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drops the current handle and returns the new generation.
    pub fn advance(&mut self) -> u64 {
        self.generation += 1;
        self.connection = None;
        self.generation
    }

    /// Stores `connection` if `generation` is still current. Returns false for a stale store.
    pub fn store(&mut self, generation: u64, connection: C) -> bool {
        if generation != self.generation {
            return false;
        }

        self.connection = Some(connection);
        true
    }

    pub fn current(&self) -> Option<C> {
        self.connection.clone()
    }
}

pub type SharedSlot<C> = Arc<Mutex<ConnectionSlot<C>>>;

/// Per address state. Only the transient fields ever change; the record itself lives as long
/// as the registry.
pub struct DeviceRecord<T: Transport> {
    pub address: String,
    pub device: Option<T::Device>,
    pub connection: SharedSlot<T::Connection>,
    pub session: Option<Session>,
}

impl<T: Transport> DeviceRecord<T> {
    fn new(address: &str) -> Self {
        DeviceRecord {
            address: address.to_string(),
            device: None,
            connection: Arc::new(Mutex::new(ConnectionSlot::new())),
            session: None,
        }
    }

    /// Tears down the active session, if any. Returns whether there was something to release.
    pub async fn release_session(&mut self) -> bool {
        let session = match self.session.take() {
            Some(session) => session,
            None => return false,
        };

        // invalidate first so the establish task can not store a handle while we wait on it
        self.connection.lock().expect("Failed to lock connection slot").advance();
        session.close().await;
        debug!("Released session for {}", self.address);
        true
    }
}

pub struct DeviceRegistry<T: Transport> {
    transport: Arc<T>,
    records: Mutex<IndexMap<String, Arc<AsyncMutex<DeviceRecord<T>>>>>,
}

impl<T: Transport> DeviceRegistry<T> {
    pub fn new(transport: Arc<T>) -> Self {
        DeviceRegistry {
            transport,
            records: Mutex::new(IndexMap::new()),
        }
    }

    pub fn get_or_create(&self, address: &str) -> Arc<AsyncMutex<DeviceRecord<T>>> {
        let mut records = self.records.lock().expect("Failed to lock device registry");

        records
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(DeviceRecord::new(address))))
            .clone()
    }

    /// Every address seen so far, oldest first.
    pub fn addresses(&self) -> Vec<String> {
        let records = self.records.lock().expect("Failed to lock device registry");
        records.keys().cloned().collect()
    }

    /// Records a device discovered by a scan.
    pub async fn insert_device(&self, address: &str, device: T::Device) {
        let record = self.get_or_create(address);
        record.lock().await.device = Some(device);
    }

    pub async fn lookup_device(&self, address: &str) -> Result<T::Device, BleError> {
        let record = self.get_or_create(address);
        let mut record = record.lock().await;
        self.resolve_device(&mut record).await
    }

    /// Like `lookup_device`, for a caller that already holds the record.
    pub async fn resolve_device(&self, record: &mut DeviceRecord<T>) -> Result<T::Device, BleError> {
        if let Some(device) = &record.device {
            return Ok(device.clone());
        }

        match self.transport.resolve_device(&record.address).await {
            Some(device) => {
                record.device = Some(device.clone());
                Ok(device)
            },
            None => Err(BleError::NotInitialized { address: record.address.clone() }),
        }
    }

    pub async fn lookup_connection(&self, address: &str) -> Result<T::Connection, BleError> {
        let record = self.get_or_create(address);
        let slot = record.lock().await.connection.clone();
        let connection = slot.lock().expect("Failed to lock connection slot").current();

        connection.ok_or_else(|| BleError::NotConnected { address: address.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::MockTransport;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn stale_generation_is_not_stored() {
        let mut slot = ConnectionSlot::<u32>::new();
        let first = slot.generation();
        let second = slot.advance();

        assert!(!slot.store(first, 1));
        assert_eq!(slot.current(), None);
        assert!(slot.store(second, 2));
        assert_eq!(slot.current(), Some(2));

        slot.advance();
        assert_eq!(slot.current(), None);
    }

    #[tokio::test]
    async fn records_are_created_once() {
        let registry = DeviceRegistry::new(Arc::new(MockTransport::new()));

        let a = registry.get_or_create(ADDRESS);
        let b = registry.get_or_create(ADDRESS);
        registry.get_or_create("11:22:33:44:55:66");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.addresses(), vec![ADDRESS.to_string(), "11:22:33:44:55:66".to_string()]);
    }

    #[tokio::test]
    async fn undiscovered_device_is_not_initialized() {
        let registry = DeviceRegistry::new(Arc::new(MockTransport::new()));

        let err = registry.lookup_device(ADDRESS).await.unwrap_err();
        assert_eq!(err, BleError::NotInitialized { address: ADDRESS.to_string() });
        // the failed lookup still leaves a record behind
        assert_eq!(registry.addresses(), vec![ADDRESS.to_string()]);
    }

    #[tokio::test]
    async fn resolved_device_is_cached() {
        let transport = Arc::new(MockTransport::new());
        transport.add_device(ADDRESS);
        let registry = DeviceRegistry::new(transport.clone());

        registry.lookup_device(ADDRESS).await.unwrap();
        transport.remove_device(ADDRESS);
        assert!(registry.lookup_device(ADDRESS).await.is_ok());
    }

    #[tokio::test]
    async fn inserted_device_skips_the_transport() {
        let registry = DeviceRegistry::new(Arc::new(MockTransport::new()));

        registry.insert_device(ADDRESS, ADDRESS.to_string()).await;
        assert_eq!(registry.lookup_device(ADDRESS).await.unwrap(), ADDRESS);
    }

    #[tokio::test]
    async fn known_device_without_connection_is_not_connected() {
        let transport = Arc::new(MockTransport::new());
        transport.add_device(ADDRESS);
        let registry = DeviceRegistry::new(transport);

        registry.lookup_device(ADDRESS).await.unwrap();
        let err = registry.lookup_connection(ADDRESS).await.unwrap_err();
        assert_eq!(err, BleError::NotConnected { address: ADDRESS.to_string() });
    }
}
