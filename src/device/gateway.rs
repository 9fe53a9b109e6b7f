use std::sync::Arc;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::device::constants::{MAX_MTU, MIN_MTU};
use crate::device::session::ConnectionManager;
use crate::device::transport::Transport;
use crate::device::types::ConnectionState;
use crate::error::BleError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CharacteristicArgs {
    mac_address: String,
    uuid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteArgs {
    mac_address: String,
    uuid: String,
    value: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MtuArgs {
    mac_address: String,
    value: u16,
}

fn address_arg(args: Value) -> Result<String, BleError> {
    Ok(serde_json::from_value(args)?)
}

fn uuid_arg(uuid: &str) -> Result<Uuid, BleError> {
    Ok(Uuid::parse_str(uuid)?)
}

/// Single shot requests against the devices of a `ConnectionManager`.
///
/// Every operation reports exactly one outcome and is never retried here.
pub struct Gateway<T: Transport> {
    manager: Arc<ConnectionManager<T>>,
}

impl<T: Transport> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Gateway { manager: self.manager.clone() }
    }
}

impl<T: Transport> Gateway<T> {
    pub fn new(manager: Arc<ConnectionManager<T>>) -> Self {
        Gateway { manager }
    }

    pub async fn get_connection_state(&self, address: &str) -> Result<ConnectionState, BleError> {
        let device = self.manager.registry().lookup_device(address).await?;
        Ok(self.manager.transport().connection_state(&device).await?)
    }

    pub async fn read_characteristic(&self, address: &str, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        let connection = self.manager.registry().lookup_connection(address).await?;

        debug!("Reading {} from {}", characteristic, address);
        self.manager.transport().read(&connection, characteristic).await.map_err(|err| {
            warn!("Reading {} from {} failed: {}", characteristic, address, err);
            err.into()
        })
    }

    pub async fn write_characteristic(&self, address: &str, characteristic: Uuid, value: &[u8]) -> Result<Vec<u8>, BleError> {
        let connection = self.manager.registry().lookup_connection(address).await?;

        debug!("Writing {} bytes to {} on {}", value.len(), characteristic, address);
        self.manager.transport().write(&connection, characteristic, value).await.map_err(|err| {
            warn!("Writing {} on {} failed: {}", characteristic, address, err);
            err.into()
        })
    }

    pub async fn request_mtu(&self, address: &str, mtu: u16) -> Result<u16, BleError> {
        let connection = self.manager.registry().lookup_connection(address).await?;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(BleError::InvalidArgument {
                detail: format!("MTU {} is outside {}..={}", mtu, MIN_MTU, MAX_MTU),
            });
        }

        debug!("Requesting MTU {} from {}", mtu, address);
        self.manager.transport().request_mtu(&connection, mtu).await.map_err(|err| {
            warn!("MTU request to {} failed: {}", address, err);
            err.into()
        })
    }

    /// `None` disconnects every device the registry knows about.
    pub async fn disconnect(&self, address: Option<&str>) -> Result<(), BleError> {
        match address {
            Some(address) => {
                self.manager.disconnect(address).await;
            },
            None => {
                let released = self.manager.disconnect_all().await;
                debug!("Disconnected {} sessions", released);
            },
        }
        Ok(())
    }

    /// Runs a request that arrived as a method name plus JSON arguments.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, BleError> {
        match method {
            "disconnect" => {
                let address: Option<String> = serde_json::from_value(args)?;
                self.disconnect(address.as_deref()).await?;
                Ok(Value::Null)
            },
            "getConnectionState" => {
                let address = address_arg(args)?;
                let state = self.get_connection_state(&address).await?;
                Ok(json!(state.ordinal()))
            },
            "readChar" => {
                let args: CharacteristicArgs = serde_json::from_value(args)?;
                let value = self.read_characteristic(&args.mac_address, uuid_arg(&args.uuid)?).await?;
                Ok(json!(value))
            },
            "writeChar" => {
                let args: WriteArgs = serde_json::from_value(args)?;
                let value = self.write_characteristic(&args.mac_address, uuid_arg(&args.uuid)?, &args.value).await?;
                Ok(json!(value))
            },
            "requestMtu" => {
                let args: MtuArgs = serde_json::from_value(args)?;
                let mtu = self.request_mtu(&args.mac_address, args.value).await?;
                Ok(json!(mtu))
            },
            _ => Err(BleError::InvalidArgument { detail: format!("unknown method {}", method) }),
        }
    }
}
