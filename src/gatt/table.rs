//! Attribute table.
//!
//! Static declaration of services, characteristics and descriptors, and the
//! registered table mapping host-assigned handles back to their behavior.
//! Nothing here changes after registration.

use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::AttributeHandle;
use crate::error::{Error, Result};
use crate::host::HostStack;

/// Characteristic property bits, as carried in the characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Properties(u8);

impl Properties {
    /// Value can be read.
    pub const READ: Self = Self(0x02);
    /// Value can be written with response.
    pub const WRITE: Self = Self(0x08);
    /// Value can be notified.
    pub const NOTIFY: Self = Self(0x10);

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        self.0
    }

    /// Check if every bit of `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if the attribute is readable.
    pub fn is_readable(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Check if the attribute is writable.
    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Check if the characteristic can notify.
    pub fn is_notifiable(&self) -> bool {
        self.contains(Self::NOTIFY)
    }
}

impl std::ops::BitOr for Properties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where a read gets its value from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSource {
    /// A fixed value.
    Static(Bytes),
    /// The current battery level.
    BatteryLevel,
    /// The owning characteristic's client configuration (CCCD only).
    ClientConfig,
}

/// Where a write goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Forward the payload to the incoming message sink.
    MessageSink,
    /// Overwrite the owning characteristic's client configuration (CCCD only).
    ClientConfig,
}

/// Handler bound to an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessBehavior {
    /// Reads only.
    ReadOnly(ReadSource),
    /// Writes only.
    WriteOnly(WriteTarget),
    /// Reads and writes.
    ReadWrite(ReadSource, WriteTarget),
}

impl AccessBehavior {
    /// The read handler, if reads are supported.
    pub fn read_source(&self) -> Option<&ReadSource> {
        match self {
            Self::ReadOnly(source) | Self::ReadWrite(source, _) => Some(source),
            Self::WriteOnly(_) => None,
        }
    }

    /// The write handler, if writes are supported.
    pub fn write_target(&self) -> Option<WriteTarget> {
        match self {
            Self::WriteOnly(target) | Self::ReadWrite(_, target) => Some(*target),
            Self::ReadOnly(_) => None,
        }
    }

    /// Check the declared properties agree with the handler.
    fn matches(&self, properties: Properties) -> bool {
        self.read_source().is_some() == properties.is_readable()
            && self.write_target().is_some() == properties.is_writable()
    }
}

/// A descriptor declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor UUID.
    pub uuid: Uuid,
    /// Read/write capabilities.
    pub properties: Properties,
    /// Bound handler.
    pub behavior: AccessBehavior,
}

impl Descriptor {
    /// A Client Characteristic Configuration Descriptor.
    pub fn client_config() -> Self {
        Self {
            uuid: crate::ble::CLIENT_CHARACTERISTIC_CONFIG_UUID,
            properties: Properties::READ | Properties::WRITE,
            behavior: AccessBehavior::ReadWrite(ReadSource::ClientConfig, WriteTarget::ClientConfig),
        }
    }
}

/// A characteristic declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Capabilities.
    pub properties: Properties,
    /// Bound handler.
    pub behavior: AccessBehavior,
    /// Descriptors in declaration order.
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// A read-only characteristic with a fixed value.
    pub fn read_only(uuid: Uuid, value: impl Into<Bytes>) -> Self {
        Self {
            uuid,
            properties: Properties::READ,
            behavior: AccessBehavior::ReadOnly(ReadSource::Static(value.into())),
            descriptors: Vec::new(),
        }
    }

    /// A write-only characteristic forwarding to the message sink.
    pub fn write_only(uuid: Uuid) -> Self {
        Self {
            uuid,
            properties: Properties::WRITE,
            behavior: AccessBehavior::WriteOnly(WriteTarget::MessageSink),
            descriptors: Vec::new(),
        }
    }

    /// Add a descriptor.
    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// Kind of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceKind {
    /// Primary service.
    #[default]
    Primary,
}

/// A service declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service UUID.
    pub uuid: Uuid,
    /// Kind of service.
    pub kind: ServiceKind,
    /// Characteristics in declaration order.
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// A primary service.
    pub fn primary(uuid: Uuid, characteristics: Vec<Characteristic>) -> Self {
        Self {
            uuid,
            kind: ServiceKind::Primary,
            characteristics,
        }
    }

    /// Number of attributes the service occupies in the host database.
    ///
    /// One for the service declaration, two per characteristic
    /// (declaration and value) and one per descriptor.
    pub fn attribute_count(&self) -> usize {
        1 + self
            .characteristics
            .iter()
            .map(|c| 2 + c.descriptors.len())
            .sum::<usize>()
    }
}

/// Whether a registered attribute is a characteristic value or a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// A characteristic value.
    Characteristic,
    /// A descriptor of the characteristic whose value handle is `owner`.
    Descriptor {
        /// Value handle of the owning characteristic.
        owner: AttributeHandle,
    },
}

/// A registered attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeEntry {
    /// Host-assigned handle.
    pub handle: AttributeHandle,
    /// Attribute UUID.
    pub uuid: Uuid,
    /// Characteristic value or descriptor.
    pub kind: AttributeKind,
    /// Capabilities.
    pub properties: Properties,
    /// Bound handler.
    pub behavior: AccessBehavior,
}

/// The registered attribute table.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    entries: BTreeMap<AttributeHandle, AttributeEntry>,
    value_handles: Vec<(Uuid, AttributeHandle)>,
}

impl AttributeTable {
    /// Register `services` with the host and build the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] if the layout is malformed or the
    /// host rejects it.
    pub fn register(services: &[Service], host: &dyn HostStack) -> Result<Self> {
        validate_layout(services)?;

        let attribute_count: usize = services.iter().map(Service::attribute_count).sum();
        debug!(
            "Registering {} services ({} attributes)",
            services.len(),
            attribute_count
        );

        let assigned = host
            .register_services(services)
            .map_err(|e| Error::Registration {
                reason: e.to_string(),
            })?;

        let characteristics: Vec<&Characteristic> = services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .collect();

        if assigned.len() != characteristics.len() {
            return Err(Error::Registration {
                reason: format!(
                    "host assigned {} value handles for {} characteristics",
                    assigned.len(),
                    characteristics.len()
                ),
            });
        }

        let mut table = Self::default();

        for (characteristic, handles) in characteristics.into_iter().zip(assigned) {
            if handles.descriptor_handles.len() != characteristic.descriptors.len() {
                return Err(Error::Registration {
                    reason: format!(
                        "host assigned {} descriptor handles for characteristic {}",
                        handles.descriptor_handles.len(),
                        characteristic.uuid
                    ),
                });
            }

            let owner = handles.value_handle;
            table.insert(AttributeEntry {
                handle: owner,
                uuid: characteristic.uuid,
                kind: AttributeKind::Characteristic,
                properties: characteristic.properties,
                behavior: characteristic.behavior.clone(),
            })?;
            table.value_handles.push((characteristic.uuid, owner));

            for (descriptor, handle) in characteristic
                .descriptors
                .iter()
                .zip(handles.descriptor_handles)
            {
                table.insert(AttributeEntry {
                    handle,
                    uuid: descriptor.uuid,
                    kind: AttributeKind::Descriptor { owner },
                    properties: descriptor.properties,
                    behavior: descriptor.behavior.clone(),
                })?;
            }
        }

        info!(
            "Registered attribute table with {} characteristics",
            table.value_handles.len()
        );

        Ok(table)
    }

    fn insert(&mut self, entry: AttributeEntry) -> Result<()> {
        if self.entries.contains_key(&entry.handle) {
            return Err(Error::Registration {
                reason: format!("host assigned handle {} twice", entry.handle),
            });
        }
        self.entries.insert(entry.handle, entry);
        Ok(())
    }

    /// Look up an attribute by handle.
    pub fn get(&self, handle: AttributeHandle) -> Option<&AttributeEntry> {
        self.entries.get(&handle)
    }

    /// Get the value handle of a characteristic.
    pub fn value_handle(&self, uuid: &Uuid) -> Option<AttributeHandle> {
        self.value_handles
            .iter()
            .find(|(u, _)| u == uuid)
            .map(|(_, h)| *h)
    }

    /// Value handles of every characteristic, in declaration order.
    pub fn value_handles(&self) -> &[(Uuid, AttributeHandle)] {
        &self.value_handles
    }

    /// Value handles of every notifiable characteristic.
    pub fn notifiable(&self) -> Vec<AttributeHandle> {
        self.value_handles
            .iter()
            .filter(|(_, h)| {
                self.entries
                    .get(h)
                    .map(|e| e.properties.is_notifiable())
                    .unwrap_or(false)
            })
            .map(|(_, h)| *h)
            .collect()
    }

    /// Number of registered characteristic values and descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reject layouts the host would choke on before handing them over.
fn validate_layout(services: &[Service]) -> Result<()> {
    let mut service_uuids = HashSet::new();

    for service in services {
        if !service_uuids.insert(service.uuid) {
            return Err(Error::Registration {
                reason: format!("duplicate service {}", service.uuid),
            });
        }
        if service.characteristics.is_empty() {
            return Err(Error::Registration {
                reason: format!("service {} has no characteristics", service.uuid),
            });
        }

        let mut characteristic_uuids = HashSet::new();
        for characteristic in &service.characteristics {
            if !characteristic_uuids.insert(characteristic.uuid) {
                return Err(Error::Registration {
                    reason: format!(
                        "duplicate characteristic {} in service {}",
                        characteristic.uuid, service.uuid
                    ),
                });
            }
            if !characteristic.behavior.matches(characteristic.properties) {
                return Err(Error::Registration {
                    reason: format!(
                        "characteristic {} handler does not match its properties",
                        characteristic.uuid
                    ),
                });
            }

            let mut descriptor_uuids = HashSet::new();
            for descriptor in &characteristic.descriptors {
                if !descriptor_uuids.insert(descriptor.uuid) {
                    return Err(Error::Registration {
                        reason: format!(
                            "duplicate descriptor {} on characteristic {}",
                            descriptor.uuid, characteristic.uuid
                        ),
                    });
                }
                if !descriptor.behavior.matches(descriptor.properties) {
                    return Err(Error::Registration {
                        reason: format!(
                            "descriptor {} handler does not match its properties",
                            descriptor.uuid
                        ),
                    });
                }
                let uses_config = matches!(
                    descriptor.behavior.read_source(),
                    Some(ReadSource::ClientConfig)
                ) || descriptor.behavior.write_target() == Some(WriteTarget::ClientConfig);
                if uses_config && !characteristic.properties.is_notifiable() {
                    return Err(Error::Registration {
                        reason: format!(
                            "client configuration on non-notifiable characteristic {}",
                            characteristic.uuid
                        ),
                    });
                }
            }
        }
    }

    Ok(())
}
