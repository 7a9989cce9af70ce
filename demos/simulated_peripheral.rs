//! Simulated peripheral: drive the HARTMAN_SIGHT core against an in-memory host
//!
//! Walks through a full client session: power on, connect, enable
//! notifications, receive battery levels, send a message, disconnect.
//!
//! Run with: cargo run --example simulated_peripheral

use hartman_sight_ble::host::HostCall;
use hartman_sight_ble::{
    AccessOp, AttributeHandle, ConnectionHandle, GapEvent, Peripheral, PeripheralConfig, Result,
    SimulatedHost, SimulatedPlatform, CLIENT_CHARACTERISTIC_CONFIG_UUID, CUSTOM_MESSAGE_UUID,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hartman_sight_ble=debug".parse().unwrap()),
        )
        .init();

    println!("HARTMAN_SIGHT simulated peripheral");
    println!("==================================\n");

    let host = Arc::new(SimulatedHost::new());
    let peripheral = Peripheral::bring_up(
        &SimulatedPlatform::new(),
        host.clone(),
        PeripheralConfig::default(),
    )
    .await?;

    println!("=== Attribute Table ===");
    for (uuid, handle) in peripheral.table().value_handles() {
        println!("  {} -> {}", handle, uuid);
    }

    // Power on
    peripheral.on_sync()?;
    println!("\nState: {}", peripheral.state());

    // Print every incoming message
    let mut messages = peripheral.subscribe_messages();
    let listener = tokio::spawn(async move {
        while let Ok(message) = messages.recv().await {
            println!(
                "  [{}] message from {}: {:?}",
                message.received_at.format("%H:%M:%S%.3f"),
                message.connection,
                message.text()
            );
        }
    });

    // Client connects
    let conn = ConnectionHandle(1);
    peripheral.handle_gap_event(GapEvent::Connect {
        status: 0,
        handle: conn,
    });
    println!("State: {}", peripheral.state());

    // Client enables notifications through the CCCD
    let level = peripheral.battery_level_handle();
    let cccd = find_cccd(&peripheral, level);
    peripheral.handle_access(conn, cccd, AccessOp::WriteDescriptor, &[0x01, 0x00])?;
    println!("\nNotifications enabled on {}", level);

    tokio::time::sleep(Duration::from_millis(3500)).await;

    // Client writes to the custom service
    if let Some(handle) = peripheral.table().value_handle(&CUSTOM_MESSAGE_UUID) {
        peripheral.handle_access(conn, handle, AccessOp::WriteCharacteristic, b"ping")?;
    }

    // Client disconnects; producers stop and advertising restarts
    peripheral.handle_gap_event(GapEvent::Disconnect {
        handle: conn,
        reason: 0x13,
    });
    println!("\nState after disconnect: {}", peripheral.state());

    tokio::time::sleep(Duration::from_secs(2)).await;

    println!("\n=== Host Traffic ===");
    for call in host.calls() {
        match call {
            HostCall::Notify { conn, attr, data } => {
                println!("  notify {} on {}: {}%", attr, conn, data[0])
            }
            other => println!("  {:?}", other),
        }
    }

    peripheral.shutdown();
    listener.abort();
    Ok(())
}

fn find_cccd(peripheral: &Peripheral, characteristic: AttributeHandle) -> AttributeHandle {
    // The CCCD directly follows the value it configures.
    let candidate = AttributeHandle(characteristic.0 + 1);
    match peripheral.table().get(candidate) {
        Some(entry) if entry.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID => candidate,
        _ => panic!("no client configuration for {}", characteristic),
    }
}
