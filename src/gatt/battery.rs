//! Simulated battery level.

/// Highest battery level, in percent.
pub const MAX_BATTERY_LEVEL: u8 = 100;

/// Battery level counter.
///
/// Counts down one percent per step and wraps from 0 back to 100, so a full
/// cycle visits every value in `0..=100` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryLevel {
    value: u8,
}

impl Default for BatteryLevel {
    fn default() -> Self {
        Self {
            value: MAX_BATTERY_LEVEL,
        }
    }
}

impl BatteryLevel {
    /// Start at `value`, clamped to 100.
    pub fn new(value: u8) -> Self {
        Self {
            value: value.min(MAX_BATTERY_LEVEL),
        }
    }

    /// The current level.
    pub fn current(&self) -> u8 {
        self.value
    }

    /// Advance to the next level and return it.
    pub fn next(&mut self) -> u8 {
        self.value = match self.value {
            0 => MAX_BATTERY_LEVEL,
            v => v - 1,
        };
        self.value
    }
}
