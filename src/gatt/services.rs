//! The device's service layout.

use crate::ble::uuids::*;
use crate::config::PeripheralConfig;

use super::table::{
    AccessBehavior, Characteristic, Descriptor, Properties, ReadSource, Service,
};

/// Build the services exposed by the device.
///
/// * Device Information: Manufacturer Name (read)
/// * Battery: Battery Information (read), Battery Level (read, notify)
/// * Custom: one write-only message characteristic
pub fn device_services(config: &PeripheralConfig) -> Vec<Service> {
    vec![
        Service::primary(
            DEVICE_INFO_SERVICE_UUID,
            vec![Characteristic::read_only(
                MANUFACTURER_NAME_UUID,
                config.manufacturer_name.clone().into_bytes(),
            )],
        ),
        Service::primary(
            BATTERY_SERVICE_UUID,
            vec![
                Characteristic::read_only(
                    BATTERY_INFORMATION_UUID,
                    config.battery_information.clone().into_bytes(),
                ),
                battery_level(),
            ],
        ),
        Service::primary(
            CUSTOM_SERVICE_UUID,
            vec![Characteristic::write_only(CUSTOM_MESSAGE_UUID)],
        ),
    ]
}

fn battery_level() -> Characteristic {
    Characteristic {
        uuid: BATTERY_LEVEL_UUID,
        properties: Properties::READ | Properties::NOTIFY,
        behavior: AccessBehavior::ReadOnly(ReadSource::BatteryLevel),
        descriptors: Vec::new(),
    }
    .with_descriptor(Descriptor::client_config())
}
