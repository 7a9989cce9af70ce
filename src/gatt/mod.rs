//! GATT server module.
//!
//! This module provides the attribute table, the access dispatcher, the
//! subscription state of notifiable characteristics and the battery level
//! they report.

pub mod access;
pub mod battery;
pub mod services;
pub mod subscription;
pub mod table;

pub use access::{AccessContext, AccessDispatcher, AccessEffect, AccessOp, OutboundBuffer};
pub use battery::{BatteryLevel, MAX_BATTERY_LEVEL};
pub use services::device_services;
pub use subscription::{apply_subscription_config, ClientConfig, SubscriptionManager};
pub use table::{
    AccessBehavior, AttributeEntry, AttributeKind, AttributeTable, Characteristic, Descriptor,
    Properties, ReadSource, Service, WriteTarget,
};
