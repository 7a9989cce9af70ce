//! In-memory host stack.
//!
//! Records every call it receives and assigns handles the way a NimBLE
//! style host lays out its attribute database. Used by the demo and the
//! tests; failures can be injected per operation.

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use super::{CharacteristicHandles, HostError, HostStack, Platform};
use crate::ble::{AddressType, AdvertisingFields, AdvertisingParams};
use crate::ble::{AttributeHandle, ConnectionHandle};
use crate::gatt::table::Service;

/// Host return code: invalid argument.
pub const HOST_EINVAL: i32 = 3;
/// Host return code: out of memory.
pub const HOST_ENOMEM: i32 = 6;
/// Host return code: operation already in progress / busy.
pub const HOST_EBUSY: i32 = 15;
/// Host return code: not connected.
pub const HOST_ENOTCONN: i32 = 7;

/// A call recorded by [`SimulatedHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    /// `set_device_name`.
    SetDeviceName(String),
    /// `register_services` with the number of services.
    RegisterServices(usize),
    /// `infer_address_type`.
    InferAddressType,
    /// `set_advertising_fields`.
    SetAdvertisingFields(AdvertisingFields),
    /// `start_advertising`.
    StartAdvertising(AddressType),
    /// `notify`.
    Notify {
        /// Connection the notification went to.
        conn: ConnectionHandle,
        /// Characteristic value handle.
        attr: AttributeHandle,
        /// Payload.
        data: Vec<u8>,
    },
}

#[derive(Debug)]
struct SimState {
    calls: Vec<HostCall>,
    first_handle: u16,
    max_attributes: Option<usize>,
    address_type: AddressType,
    tx_power_dbm: i8,
    advertising_data: Option<Bytes>,
    advertising_failures: u32,
    fail_notifications: bool,
    fail_name: bool,
}

/// A host stack that lives entirely in memory.
#[derive(Debug)]
pub struct SimulatedHost {
    state: Mutex<SimState>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// Create a host that accepts everything.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                calls: Vec::new(),
                first_handle: 1,
                max_attributes: None,
                address_type: AddressType::Public,
                tx_power_dbm: 0,
                advertising_data: None,
                advertising_failures: 0,
                fail_notifications: false,
                fail_name: false,
            }),
        }
    }

    /// Start handle assignment at `handle` instead of 1.
    pub fn with_first_handle(self, handle: u16) -> Self {
        self.state.lock().first_handle = handle;
        self
    }

    /// Reject registrations needing more than `max` attributes.
    pub fn with_max_attributes(self, max: usize) -> Self {
        self.state.lock().max_attributes = Some(max);
        self
    }

    /// Report `address_type` from address inference.
    pub fn with_address_type(self, address_type: AddressType) -> Self {
        self.state.lock().address_type = address_type;
        self
    }

    /// Fill automatic TX power fields with `dbm`.
    pub fn with_tx_power(self, dbm: i8) -> Self {
        self.state.lock().tx_power_dbm = dbm;
        self
    }

    /// Reject the device name.
    pub fn with_name_rejected(self) -> Self {
        self.state.lock().fail_name = true;
        self
    }

    /// Make the next `count` advertising starts fail.
    pub fn fail_next_advertising_starts(&self, count: u32) {
        self.state.lock().advertising_failures = count;
    }

    /// Make notifications fail until turned off again.
    pub fn set_notifications_failing(&self, failing: bool) {
        self.state.lock().fail_notifications = failing;
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// The advertising payload last accepted, as it would go on air.
    pub fn advertising_data(&self) -> Option<Bytes> {
        self.state.lock().advertising_data.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Payloads of every accepted notification, in order.
    pub fn notifications(&self) -> Vec<(ConnectionHandle, AttributeHandle, Vec<u8>)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                HostCall::Notify { conn, attr, data } => Some((*conn, *attr, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of advertising starts received, successful or not.
    pub fn advertising_starts(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, HostCall::StartAdvertising(_)))
            .count()
    }
}

impl HostStack for SimulatedHost {
    fn set_device_name(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::SetDeviceName(name.to_string()));
        if state.fail_name {
            return Err(HostError::new(HOST_ENOMEM));
        }
        Ok(())
    }

    fn register_services(
        &self,
        services: &[Service],
    ) -> Result<Vec<CharacteristicHandles>, HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::RegisterServices(services.len()));

        let needed: usize = services.iter().map(Service::attribute_count).sum();
        if let Some(max) = state.max_attributes {
            if needed > max {
                return Err(HostError::new(HOST_ENOMEM));
            }
        }

        let mut next = state.first_handle;
        let mut assigned = Vec::new();
        for service in services {
            // Service declaration.
            next += 1;
            for characteristic in &service.characteristics {
                // Declaration, then value.
                let value_handle = AttributeHandle(next + 1);
                next += 2;
                let descriptor_handles = characteristic
                    .descriptors
                    .iter()
                    .map(|_| {
                        let handle = AttributeHandle(next);
                        next += 1;
                        handle
                    })
                    .collect();
                assigned.push(CharacteristicHandles {
                    value_handle,
                    descriptor_handles,
                });
            }
        }

        trace!("Simulated host assigned {} attributes", needed);
        Ok(assigned)
    }

    fn infer_address_type(&self) -> Result<AddressType, HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::InferAddressType);
        Ok(state.address_type)
    }

    fn set_advertising_fields(&self, fields: &AdvertisingFields) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(HostCall::SetAdvertisingFields(fields.clone()));
        let data = fields
            .encode(state.tx_power_dbm)
            .map_err(|_| HostError::new(HOST_EINVAL))?;
        state.advertising_data = Some(data);
        Ok(())
    }

    fn start_advertising(
        &self,
        address_type: AddressType,
        _params: &AdvertisingParams,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::StartAdvertising(address_type));
        if state.advertising_failures > 0 {
            state.advertising_failures -= 1;
            return Err(HostError::new(HOST_EBUSY));
        }
        Ok(())
    }

    fn notify(
        &self,
        conn: ConnectionHandle,
        attr: AttributeHandle,
        data: &[u8],
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if state.fail_notifications {
            return Err(HostError::new(HOST_ENOTCONN));
        }
        state.calls.push(HostCall::Notify {
            conn,
            attr,
            data: data.to_vec(),
        });
        Ok(())
    }
}

/// A platform whose bring-up steps succeed unless told otherwise.
#[derive(Debug, Default)]
pub struct SimulatedPlatform {
    /// Error returned by storage initialization.
    pub storage_error: Option<HostError>,
    /// Error returned by controller initialization.
    pub controller_error: Option<HostError>,
}

impl SimulatedPlatform {
    /// A platform that brings up cleanly.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Platform for SimulatedPlatform {
    async fn init_storage(&self) -> Result<(), HostError> {
        match self.storage_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn init_controller(&self) -> Result<(), HostError> {
        match self.controller_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
