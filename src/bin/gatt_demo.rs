//! gatt-demo - drive a GATT session against a simulated peripheral
//!
//! Connects, reads the characteristic, writes a payload, subscribes and
//! prints one notification, then disconnects. Useful for watching the
//! session's state transitions and queueing with `RUST_LOG=debug`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gatt_session::ble::simulated::SimPeripheral;
use gatt_session::{
    BleAddress, CharacteristicId, DeviceIdentity, GattSession, ServiceCatalog, ServiceId,
    SessionConfig, WriteMode,
};

#[derive(Parser)]
#[command(name = "gatt-demo")]
#[command(about = "Run a GATT session against a simulated peripheral", long_about = None)]
struct Cli {
    /// Peripheral MAC address
    #[arg(long, default_value = "38:AB:41:3C:D4:34")]
    address: BleAddress,

    /// Service UUID (16-bit short form or full)
    #[arg(long, default_value = "ffe0")]
    service: ServiceId,

    /// Characteristic UUID (16-bit short form or full)
    #[arg(long, default_value = "ffe1")]
    characteristic: CharacteristicId,

    /// Payload to write, as text
    #[arg(long, default_value = "Test", conflicts_with = "hex")]
    payload: String,

    /// Payload to write, as hex
    #[arg(long)]
    hex: Option<String>,

    /// Write mode: with-response, without-response or signed
    #[arg(long, default_value = "signed")]
    mode: WriteMode,

    /// JSON session config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print status events as JSON lines
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    let payload = match &cli.hex {
        Some(hex) => hex::decode(hex).context("decoding --hex payload")?,
        None => cli.payload.clone().into_bytes(),
    };

    let catalog = ServiceCatalog::new().with_service(cli.service, [cli.characteristic]);
    let peripheral = SimPeripheral::new(catalog);
    let controller = peripheral.controller();
    controller.set_value(cli.characteristic, b"ready".to_vec());

    let session = GattSession::new(peripheral, config);
    let mut status = session.status_events();
    let json_events = cli.json_events;
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            if json_events {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("Failed to encode status event: {}", e),
                }
            } else {
                log::info!("{:?}", event.kind);
            }
        }
    });

    let device = DeviceIdentity::new(cli.address.clone(), "simulated");
    println!("Connecting to {}", device);
    session.connect(device).wait().await.context("connect")?;

    let value = session
        .read(cli.characteristic)
        .wait()
        .await
        .context("read")?;
    println!("Read {}: {}", cli.characteristic, hex::encode(&value));

    session
        .write(cli.characteristic, payload.clone(), cli.mode)
        .wait()
        .await
        .context("write")?;
    println!("Wrote {} ({:?})", hex::encode(&payload), cli.mode);

    let mut notifications = session.notifications();
    session
        .subscribe(cli.characteristic)
        .wait()
        .await
        .context("subscribe")?;
    if !controller.notify(cli.characteristic, b"pong".to_vec()) {
        bail!("peripheral refused to notify on {}", cli.characteristic);
    }
    let notification = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .context("waiting for notification")?
        .context("notification channel closed")?;
    println!(
        "Notification on {}: {}",
        notification.characteristic,
        hex::encode(&notification.value)
    );

    session.disconnect().wait().await.context("disconnect")?;
    println!("Disconnected");
    Ok(())
}
