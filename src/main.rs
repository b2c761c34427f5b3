//! CLI demo harness — not part of the CORE itself. Wires a configured
//! [`RegionTriggerEngine`] and [`PresentationEngine`] to a scriptable
//! in-memory [`MockTransport`] for local exercising and log inspection, the
//! same role the teacher's interactive CLI plays for manually driving its
//! agent orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use uuid::Uuid;

use beacon_credential_client::config::{EngineConfig, EngineConfigOverrides, TomlConfig};
use beacon_credential_client::presentation::PresentationEngine;
use beacon_credential_client::region::{BeaconEvent, RegionTriggerEngine};
use beacon_credential_client::transport::{
    CharacteristicHandle, MockTransport, PeripheralHandle, ServiceHandle, Transport,
    TransportEvent,
};

#[derive(Parser)]
#[command(
    name = "beacon-credential-client",
    about = "Beacon-triggered GATT access-credential presentation client (demo harness)",
    version
)]
struct Args {
    /// Data directory holding an optional config.toml
    #[arg(long, env = "BEACON_CLIENT_DATA_DIR", default_value = ".")]
    data_dir: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BEACON_CLIENT_LOG", default_value = "info")]
    log: String,

    /// 128-bit GATT service UUID to scan/discover for
    #[arg(long, default_value = "0000feed-0000-1000-8000-00805f9b34fb")]
    service_uuid: Uuid,

    /// 128-bit data-transfer characteristic UUID
    #[arg(long, default_value = "0000feef-0000-1000-8000-00805f9b34fb")]
    characteristic_uuid: Uuid,

    /// Region identifier to arm presentation on entry
    #[arg(long, default_value = "0000dead-0000-1000-8000-00805f9b34fb")]
    region: Uuid,

    #[arg(long)]
    scan_timeout_secs: Option<u64>,
    #[arg(long)]
    connection_timeout_secs: Option<u64>,
    #[arg(long)]
    response_timeout_secs: Option<u64>,
    #[arg(long)]
    retry_max: Option<u32>,
    #[arg(long)]
    retry_backoff_secs: Option<u64>,
    #[arg(long)]
    restore_identifier: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(&args.log).compact().init();

    let toml = TomlConfig::load(&args.data_dir);
    let config = EngineConfig::new(
        args.service_uuid,
        args.characteristic_uuid,
        *b"a1b2c3d4e5f6a1b2",
        hex_device_key().context("building demo device key")?,
        "prod-pin_access_tool-7603489".to_string(),
        EngineConfigOverrides {
            scan_timeout_secs: args.scan_timeout_secs,
            connection_timeout_secs: args.connection_timeout_secs,
            response_timeout_secs: args.response_timeout_secs,
            retry_max: args.retry_max,
            retry_backoff_secs: args.retry_backoff_secs,
            restore_identifier: args.restore_identifier,
        },
        toml,
    );

    info!(service_uuid = %args.service_uuid, region = %args.region, "demo harness starting");

    let transport = Arc::new(MockTransport::new());
    let sender = transport.sender();

    let presentation = Arc::new(PresentationEngine::new(
        config,
        transport.clone() as Arc<dyn Transport>,
        |result| info!(success = result.success, message = %result.message, "presentation complete"),
    ));

    let region_engine = Arc::new(RegionTriggerEngine::new(args.region, presentation.clone()));

    // Scripted happy-path scenario: simulate a reader appearing and
    // completing the handshake a moment after region entry.
    tokio::spawn(run_scripted_reader(transport.clone(), sender, args.characteristic_uuid));

    region_engine.handle_event(BeaconEvent::Entered(args.region)).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(occupancy = ?region_engine.occupancy().await, "demo harness finished");

    Ok(())
}

fn hex_device_key() -> Result<[u8; 16]> {
    let hex = "13f75379273f324d31335278a66062af";
    let bytes = (0..32)
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .context("parsing demo device key hex")?;
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes[..16]);
    Ok(key)
}

/// Plays the part of a well-behaved reader against the [`MockTransport`],
/// just enough to exercise the happy path end to end for manual inspection.
/// Reads the engine's outbound frames from `MockTransport::written` rather
/// than guessing their contents, so the demo actually completes.
async fn run_scripted_reader(
    transport: Arc<MockTransport>,
    sender: tokio::sync::mpsc::Sender<TransportEvent>,
    characteristic_uuid: Uuid,
) {
    use beacon_credential_client::codec;
    use beacon_credential_client::crypto;

    let peripheral = PeripheralHandle {
        id: "demo-reader".to_string(),
        name: Some("Demo Reader".to_string()),
    };
    let service = ServiceHandle {
        id: "svc".to_string(),
        uuid: characteristic_uuid,
    };
    let characteristic = CharacteristicHandle {
        id: "char".to_string(),
        uuid: characteristic_uuid,
    };

    let _ = sender.send(TransportEvent::PeripheralDiscovered(peripheral.clone())).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = sender.send(TransportEvent::Connected(peripheral)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = sender.send(TransportEvent::ServicesDiscovered(service)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = sender
        .send(TransportEvent::CharacteristicsDiscovered(characteristic.clone()))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = sender.send(TransportEvent::Subscribed(characteristic)).await;

    let device_key = hex_device_key().unwrap_or([0u8; 16]);

    // Wait for AUTH_REQUEST (arrives ~100ms after Subscribed, per the
    // subscribe delay), decrypt it to recover Nonce_M, and echo it back
    // alongside a fresh Nonce_R — exactly what a real reader would do.
    let auth_request = poll_for_write(&transport, 0).await;
    if let Some(frame) = auth_request {
        let iv = &frame[17..33];
        let ciphertext = &frame[33..65];
        if let Ok(nonce_m) = crypto::decrypt(&device_key, iv, ciphertext) {
            let nonce_r = [0x42u8; 16];
            let mut plaintext = nonce_m;
            plaintext.extend_from_slice(&nonce_r);
            if let Ok(enc) = crypto::encrypt(&device_key, &plaintext, None) {
                let mut response = vec![codec::TYPE_AUTH_RESPONSE];
                response.extend_from_slice(&enc.iv);
                response.extend_from_slice(&enc.ciphertext);
                let _ = sender.send(TransportEvent::Notification(response)).await;
            }
        }
    }

    // Wait for CREDENTIAL, then grant access.
    if poll_for_write(&transport, 1).await.is_some() {
        let response = vec![codec::TYPE_CREDENTIAL_RESPONSE, 0x00];
        let _ = sender.send(TransportEvent::Notification(response)).await;
    }
}

/// Polls `MockTransport::written` until it has at least `index + 1` frames,
/// giving up after a second — demo-only, a real test uses
/// `tokio::time::pause`/`advance` instead of wall-clock polling.
async fn poll_for_write(transport: &MockTransport, index: usize) -> Option<Vec<u8>> {
    for _ in 0..20 {
        if let Some(frame) = transport.written.lock().unwrap().get(index).cloned() {
            return Some(frame);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}
