//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! Contains all UUID constants exposed by the HARTMAN_SIGHT attribute table.

use uuid::Uuid;

const BASE_UUID_BITS: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// The Bluetooth base UUID that 16-bit SIG assigned numbers expand onto.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE_UUID_BITS);

/// Expand a 16-bit SIG assigned number onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID_BITS | ((short as u128) << 96))
}

/// Build a UUID from its 16 bytes in little-endian (on-air) order.
pub const fn uuid128_le(bytes: [u8; 16]) -> Uuid {
    Uuid::from_u128(u128::from_le_bytes(bytes))
}

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid16(0x180A);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = uuid16(0x2A29);

// Battery Service (Standard BLE)
/// Standard BLE Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid16(0x180F);
/// Battery Level characteristic UUID (Read, Notify).
pub const BATTERY_LEVEL_UUID: Uuid = uuid16(0x2A19);
/// Battery Information characteristic UUID (Read).
pub const BATTERY_INFORMATION_UUID: Uuid = uuid16(0x2BEC);

/// Client Characteristic Configuration Descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = uuid16(0x2902);

// Custom message service
/// Custom message service UUID.
pub const CUSTOM_SERVICE_UUID: Uuid = uuid128_le([
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
]);
/// Custom message characteristic UUID (Write).
pub const CUSTOM_MESSAGE_UUID: Uuid = uuid128_le([
    0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa, 0x99, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00,
]);

/// Check if a UUID is the Client Characteristic Configuration Descriptor.
pub fn is_cccd(uuid: &Uuid) -> bool {
    *uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID
}
