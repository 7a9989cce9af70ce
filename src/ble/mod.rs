//! BLE link-layer module.
//!
//! This module provides the GAP side of the peripheral: identity UUIDs,
//! advertising payload construction and the connection state machine.

pub mod advertising;
pub mod connection;
pub mod uuids;

pub use advertising::{AddressType, AdvertisingFields, AdvertisingParams};
pub use connection::{
    AttributeHandle, Connection, ConnectionHandle, ConnectionState, GapAction, GapEvent,
    GapMachine,
};
pub use uuids::*;
