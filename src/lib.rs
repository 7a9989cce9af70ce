// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # hartman-sight-ble
//!
//! The BLE peripheral core of the HARTMAN_SIGHT device: a GATT server that
//! advertises the device identity, exposes a small fixed set of services and
//! streams battery-level notifications to a subscribed client.
//!
//! The radio, the controller and the BLE host stack are external
//! collaborators reached through the [`HostStack`] and [`Platform`] traits.
//! A [`SimulatedHost`] is included for demos and tests.
//!
//! ## Features
//!
//! - **Advertising**: Complete local name, general and limited discoverable
//!   flags and automatic TX power, restarted with bounded backoff
//! - **Device Information**: Manufacturer Name
//! - **Battery**: Battery Information and a notifiable Battery Level
//! - **Custom Service**: A write-only characteristic whose payloads are
//!   forwarded as [`IncomingMessage`]s
//! - **Single Connection**: Stale connection handles are ignored, and
//!   every producer stops on disconnect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hartman_sight_ble::{
//!     AccessOp, ConnectionHandle, GapEvent, Peripheral, PeripheralConfig, Result,
//!     SimulatedHost, SimulatedPlatform,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let host = Arc::new(SimulatedHost::new());
//!     let peripheral = Peripheral::bring_up(
//!         &SimulatedPlatform::new(),
//!         host.clone(),
//!         PeripheralConfig::default(),
//!     )
//!     .await?;
//!
//!     // The host reports it is ready: start advertising.
//!     peripheral.on_sync()?;
//!
//!     // A client connects and enables notifications on the battery level.
//!     let conn = ConnectionHandle(1);
//!     peripheral.handle_gap_event(GapEvent::Connect { status: 0, handle: conn });
//!     peripheral.handle_gap_event(GapEvent::Subscribe {
//!         handle: conn,
//!         attr_handle: peripheral.battery_level_handle(),
//!         notify: true,
//!         indicate: false,
//!     });
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(3)).await;
//!     println!("Sent {} notifications", host.notifications().len());
//!
//!     let level = peripheral.handle_access(
//!         conn,
//!         peripheral.battery_level_handle(),
//!         AccessOp::ReadCharacteristic,
//!         &[],
//!     )?;
//!     println!("Battery level: {}%", level[0]);
//!
//!     peripheral.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization of the configuration

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod gatt;
pub mod host;
pub mod peripheral;

// Re-exports for convenience
pub use config::{PeripheralConfig, RestartPolicy};
pub use error::{Error, Result};
pub use host::{HostError, HostStack, Platform, SimulatedHost, SimulatedPlatform};
pub use peripheral::{IncomingMessage, Peripheral};

// Re-export commonly used types from submodules
pub use ble::{
    AddressType, AdvertisingFields, AdvertisingParams, AttributeHandle, ConnectionHandle,
    ConnectionState, GapEvent,
};
pub use ble::uuids::{
    BATTERY_INFORMATION_UUID, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
    CLIENT_CHARACTERISTIC_CONFIG_UUID, CUSTOM_MESSAGE_UUID, CUSTOM_SERVICE_UUID,
    DEVICE_INFO_SERVICE_UUID, MANUFACTURER_NAME_UUID,
};
pub use gatt::{
    apply_subscription_config, AccessOp, AttributeTable, BatteryLevel, Characteristic,
    ClientConfig, Descriptor, Properties, Service,
};
