use std::path::PathBuf;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use log::{error, info};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use ble_connect::{init_logging, Bridge};
use ble_connect::config::io::ConfigIO;
use ble_connect::config::types::Config;
use ble_connect::device::btle::BtleplugTransport;
use ble_connect::device::types::ConnectionEvent;
use ble_connect::error::{AppRunError, BleError, ConfigError};

#[derive(Parser, Debug)]
#[command(version, about = "Connect to BLE peripherals and talk to their characteristics")]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print connection state changes until interrupted
    Watch {
        address: String,
        /// Keep trying until the device shows up
        #[arg(long)]
        wait: bool,
    },
    /// Print the connection state ordinal
    State { address: String },
    /// Read a characteristic
    Read { address: String, uuid: String },
    /// Write a characteristic; the value is a JSON array of bytes, e.g. [1,2,3]
    Write { address: String, uuid: String, value: String },
    /// Request an MTU
    Mtu { address: String, value: u16 },
}

impl Command {
    fn address(&self) -> &str {
        match self {
            Command::Watch { address, .. }
            | Command::State { address }
            | Command::Read { address, .. }
            | Command::Write { address, .. }
            | Command::Mtu { address, .. } => address.as_str(),
        }
    }
}

async fn watch(bridge: &Bridge<BtleplugTransport>, address: &str, wait: bool) -> Result<(), BleError> {
    let mut events = bridge.events.on_listen(json!({"macAddress": address, "waitForDevice": wait})).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bridge.events.on_cancel(json!({"macAddress": address})).await?;
            },
            event = events.next() => match event {
                Some(ConnectionEvent::StateChange(state)) => println!("{} {}", state.ordinal(), state),
                Some(ConnectionEvent::Failed(err)) => return Err(err),
                None => return Ok(()),
            },
        }
    }
}

async fn request(bridge: &Bridge<BtleplugTransport>, command: &Command, config: &Config) -> Result<Value, BleError> {
    let address = command.address();
    let (method, args) = match command {
        Command::State { .. } => return bridge.gateway.call("getConnectionState", json!(address)).await,
        Command::Read { uuid, .. } => ("readChar", json!({"macAddress": address, "uuid": uuid})),
        Command::Write { uuid, value, .. } => {
            let value: Value = serde_json::from_str(value)?;
            ("writeChar", json!({"macAddress": address, "uuid": uuid, "value": value}))
        },
        Command::Mtu { value, .. } => ("requestMtu", json!({"macAddress": address, "value": value})),
        Command::Watch { .. } => {
            return Err(BleError::InvalidArgument { detail: "watch is a subscription, not a request".to_string() });
        },
    };

    let mut events = bridge.events.on_listen(json!({"macAddress": address, "waitForDevice": false})).await;
    let result = match bridge.wait_until_ready(address, &mut events, config.connect_deadline).await {
        Ok(()) => bridge.gateway.call(method, args).await,
        Err(err) => Err(err),
    };

    bridge.gateway.call("disconnect", json!(address)).await?;
    result
}

async fn run(command: Command, config: Config) -> Result<(), AppRunError> {
    let transport = Arc::new(BtleplugTransport::new(config.clone()).await?);
    transport.start_scan().await?;
    sleep(Duration::from_millis(config.scan_duration)).await;

    let bridge = Bridge::new(transport.clone());
    let result = match &command {
        Command::Watch { address, wait } => watch(&bridge, address, *wait).await,
        command => request(&bridge, command, &config).await.map(|value| println!("{}", value)),
    };

    transport.stop_scan().await?;
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let args = Args::parse();

    let mut config_io = ConfigIO::open_sync(args.config.as_deref())?;
    let config = config_io.read().await?;
    init_logging(&config);
    info!(concat!("ble-connect ", env!("CARGO_PKG_VERSION")));

    // one instance per adapter; the config file lock doubles as the instance lock
    let mut locker = config_io.locker()?;
    let _guard = match locker.lock() {
        Ok(guard) => guard,
        Err(err) => {
            if let ConfigError::CanNotLock { .. } = err {
                error!("Another ble-connect instance is already running");
            }
            return Err(err.into());
        },
    };

    if let Err(err) = run(args.command, config).await {
        error!("{}", err);
        return Err(err);
    }
    Ok(())
}
