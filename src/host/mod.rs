//! External collaborators.
//!
//! The core never talks to a radio directly. Bring-up of storage and the
//! controller goes through [`Platform`], and every GAP/GATT call goes
//! through [`HostStack`].
//!
//! Host calls are fire-and-forget: they must not block, and they must not
//! invoke the peripheral's entry points synchronously. Completion is
//! delivered later as a distinct event.

use async_trait::async_trait;
use thiserror::Error;

use crate::ble::{AddressType, AdvertisingFields, AdvertisingParams};
use crate::ble::{AttributeHandle, ConnectionHandle};
use crate::gatt::table::Service;

pub mod sim;

pub use sim::{HostCall, SimulatedHost, SimulatedPlatform};

/// Error code returned by a host collaborator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Host stack returned error code {code}")]
pub struct HostError {
    /// Raw host return code.
    pub code: i32,
}

impl HostError {
    /// Create from a raw host return code.
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

/// Handles assigned to one characteristic at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandles {
    /// Handle of the characteristic value.
    pub value_handle: AttributeHandle,
    /// Handles of the characteristic's descriptors, in declaration order.
    pub descriptor_handles: Vec<AttributeHandle>,
}

/// The BLE host stack the core drives.
#[cfg_attr(test, mockall::automock)]
pub trait HostStack: Send + Sync {
    /// Set the GAP device name.
    fn set_device_name(&self, name: &str) -> Result<(), HostError>;

    /// Register the attribute table.
    ///
    /// Returns the handles of every characteristic, flattened in
    /// declaration order across all services.
    fn register_services(
        &self,
        services: &[Service],
    ) -> Result<Vec<CharacteristicHandles>, HostError>;

    /// Infer the local address type to advertise with (privacy disabled).
    fn infer_address_type(&self) -> Result<AddressType, HostError>;

    /// Configure the advertising payload.
    fn set_advertising_fields(&self, fields: &AdvertisingFields) -> Result<(), HostError>;

    /// Start advertising.
    fn start_advertising(
        &self,
        address_type: AddressType,
        params: &AdvertisingParams,
    ) -> Result<(), HostError>;

    /// Send a notification of `data` for `attr` over `conn`.
    fn notify(
        &self,
        conn: ConnectionHandle,
        attr: AttributeHandle,
        data: &[u8],
    ) -> Result<(), HostError>;
}

/// One-time hardware bring-up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Initialize non-volatile storage.
    async fn init_storage(&self) -> Result<(), HostError>;

    /// Initialize the radio controller and the host.
    async fn init_controller(&self) -> Result<(), HostError>;
}
