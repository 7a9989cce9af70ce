//! Peripheral configuration.
//!
//! Identity strings, notification timing and the advertising restart policy.

use std::time::Duration;

use crate::ble::AdvertisingFields;
use crate::error::{Error, Result};
use crate::gatt::battery::MAX_BATTERY_LEVEL;

/// Default GAP device name.
pub const DEFAULT_DEVICE_NAME: &str = "HARTMAN_SIGHT";

/// Default manufacturer name.
pub const DEFAULT_MANUFACTURER_NAME: &str = "PARAS DEFENSE";

/// Default battery information string.
pub const DEFAULT_BATTERY_INFORMATION: &str = "NOT CONNECTED";

/// Exponential backoff for advertising restarts.
///
/// Once `max_attempts` have failed, retries continue every `max_delay`
/// until the host accepts advertising again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RestartPolicy {
    /// Attempts with a growing delay, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Configuration of the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PeripheralConfig {
    /// GAP device name, also advertised as the complete local name.
    pub device_name: String,
    /// Manufacturer Name characteristic value.
    pub manufacturer_name: String,
    /// Battery Information characteristic value.
    pub battery_information: String,
    /// Period of the notification producer.
    pub notify_period: Duration,
    /// Battery level before the first notification.
    pub battery_start: u8,
    /// Enable notifications as soon as a client connects.
    pub notifications_enabled_on_connect: bool,
    /// Largest read response, in bytes.
    pub attribute_capacity: usize,
    /// Advertising restart policy.
    pub restart: RestartPolicy,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            manufacturer_name: DEFAULT_MANUFACTURER_NAME.to_string(),
            battery_information: DEFAULT_BATTERY_INFORMATION.to_string(),
            notify_period: Duration::from_secs(1),
            battery_start: MAX_BATTERY_LEVEL,
            notifications_enabled_on_connect: false,
            attribute_capacity: 512,
            restart: RestartPolicy::default(),
        }
    }
}

impl PeripheralConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the manufacturer name.
    pub fn with_manufacturer_name(mut self, name: impl Into<String>) -> Self {
        self.manufacturer_name = name.into();
        self
    }

    /// Set the battery information string.
    pub fn with_battery_information(mut self, info: impl Into<String>) -> Self {
        self.battery_information = info.into();
        self
    }

    /// Set the notification period.
    pub fn with_notify_period(mut self, period: Duration) -> Self {
        self.notify_period = period;
        self
    }

    /// Set the starting battery level.
    pub fn with_battery_start(mut self, level: u8) -> Self {
        self.battery_start = level;
        self
    }

    /// Enable notifications at connect instead of waiting for the client.
    pub fn with_notifications_enabled_on_connect(mut self, enabled: bool) -> Self {
        self.notifications_enabled_on_connect = enabled;
        self
    }

    /// Set the largest read response.
    pub fn with_attribute_capacity(mut self, capacity: usize) -> Self {
        self.attribute_capacity = capacity;
        self
    }

    /// Set the advertising restart policy.
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(invalid("device_name", "empty"));
        }
        AdvertisingFields::for_device(&self.device_name).validate()?;

        if self.notify_period.is_zero() {
            return Err(invalid("notify_period", "0s"));
        }
        if self.battery_start > MAX_BATTERY_LEVEL {
            return Err(invalid("battery_start", self.battery_start));
        }
        if self.attribute_capacity == 0 {
            return Err(invalid("attribute_capacity", 0));
        }
        if self.restart.max_attempts == 0 {
            return Err(invalid("restart.max_attempts", 0));
        }
        if self.restart.initial_delay > self.restart.max_delay {
            return Err(invalid(
                "restart.initial_delay",
                format!("{:?} > {:?}", self.restart.initial_delay, self.restart.max_delay),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl ToString) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
