//! Notification subscriptions.
//!
//! Tracks the Client Characteristic Configuration of every notifiable
//! characteristic and whether its producer should be armed. The armed flag
//! is always re-derived from the most recently applied configuration.

use std::collections::BTreeMap;
use tracing::debug;

use crate::ble::AttributeHandle;
use crate::error::{Error, Result};

/// Width of a Client Characteristic Configuration value.
pub const CLIENT_CONFIG_LEN: usize = 2;

/// Bit 0 of the first configuration byte: notifications enabled.
pub const NOTIFICATIONS_ENABLED: u8 = 0x01;

/// Bit 1 of the first configuration byte: indications enabled.
pub const INDICATIONS_ENABLED: u8 = 0x02;

/// Derive whether notifications are enabled from configuration bytes.
///
/// Only bit 0 of the first byte is significant. Both the descriptor access
/// path and the native subscribe path go through here.
pub fn apply_subscription_config(config: &[u8; CLIENT_CONFIG_LEN]) -> bool {
    config[0] & NOTIFICATIONS_ENABLED != 0
}

/// Client Characteristic Configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientConfig([u8; CLIENT_CONFIG_LEN]);

impl ClientConfig {
    /// Notifications and indications disabled.
    pub const DISABLED: Self = Self([0x00, 0x00]);
    /// Notifications enabled.
    pub const NOTIFY: Self = Self([NOTIFICATIONS_ENABLED, 0x00]);

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; CLIENT_CONFIG_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from native subscription flags.
    pub fn from_flags(notify: bool, indicate: bool) -> Self {
        let mut first = 0;
        if notify {
            first |= NOTIFICATIONS_ENABLED;
        }
        if indicate {
            first |= INDICATIONS_ENABLED;
        }
        Self([first, 0x00])
    }

    /// Raw bytes.
    pub fn to_bytes(&self) -> [u8; CLIENT_CONFIG_LEN] {
        self.0
    }

    /// The value after a client write of `payload`.
    ///
    /// Copies at most two bytes from the start of `payload`. Bytes the
    /// payload does not cover keep their current value.
    pub fn written(&self, payload: &[u8]) -> Self {
        let mut bytes = self.0;
        let len = payload.len().min(CLIENT_CONFIG_LEN);
        bytes[..len].copy_from_slice(&payload[..len]);
        Self(bytes)
    }

    /// Check if notifications are enabled.
    pub fn notifications_enabled(&self) -> bool {
        apply_subscription_config(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    config: ClientConfig,
    armed: bool,
}

/// Per-characteristic subscription state.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    slots: BTreeMap<AttributeHandle, Slot>,
}

impl SubscriptionManager {
    /// Track the given notifiable characteristics, all disabled.
    pub fn new(characteristics: impl IntoIterator<Item = AttributeHandle>) -> Self {
        Self {
            slots: characteristics
                .into_iter()
                .map(|handle| (handle, Slot::default()))
                .collect(),
        }
    }

    /// Check if `characteristic` is tracked.
    pub fn contains(&self, characteristic: AttributeHandle) -> bool {
        self.slots.contains_key(&characteristic)
    }

    /// Current configuration of `characteristic`.
    pub fn config(&self, characteristic: AttributeHandle) -> Option<ClientConfig> {
        self.slots.get(&characteristic).map(|s| s.config)
    }

    /// Check if the producer for `characteristic` should be running.
    pub fn is_armed(&self, characteristic: AttributeHandle) -> bool {
        self.slots
            .get(&characteristic)
            .map(|s| s.armed)
            .unwrap_or(false)
    }

    /// Characteristics whose producer should be running.
    pub fn armed(&self) -> Vec<AttributeHandle> {
        self.slots
            .iter()
            .filter(|(_, s)| s.armed)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Store `config` and re-derive the armed flag from it.
    ///
    /// Returns whether notifications are enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAttribute`] if `characteristic` is not notifiable.
    pub fn apply(&mut self, characteristic: AttributeHandle, config: ClientConfig) -> Result<bool> {
        let slot = self
            .slots
            .get_mut(&characteristic)
            .ok_or(Error::UnknownAttribute {
                handle: characteristic.0,
            })?;
        slot.config = config;

        let enabled = config.notifications_enabled();
        if enabled {
            self.enable(characteristic);
        } else {
            self.disable(characteristic);
        }
        Ok(enabled)
    }

    /// Arm the producer. Enabling twice is a no-op.
    pub fn enable(&mut self, characteristic: AttributeHandle) {
        if let Some(slot) = self.slots.get_mut(&characteristic) {
            if !slot.armed {
                debug!("Notifications enabled for {}", characteristic);
            }
            slot.armed = true;
        }
    }

    /// Disarm the producer. Disabling twice is a no-op.
    pub fn disable(&mut self, characteristic: AttributeHandle) {
        if let Some(slot) = self.slots.get_mut(&characteristic) {
            if slot.armed {
                debug!("Notifications disabled for {}", characteristic);
            }
            slot.armed = false;
        }
    }

    /// Reset every configuration to disabled and disarm everything.
    ///
    /// Returns the characteristics that were armed.
    pub fn reset_all(&mut self) -> Vec<AttributeHandle> {
        let was_armed = self.armed();
        for slot in self.slots.values_mut() {
            *slot = Slot::default();
        }
        was_armed
    }
}
