//! GATT access dispatch.
//!
//! Routes a client read or write to the handler bound to the attribute.
//! Dispatch itself never mutates shared state: it fills the outbound buffer
//! and reports the effect the caller must apply.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::{debug, trace};

use super::subscription::{ClientConfig, SubscriptionManager};
use super::table::{AttributeKind, AttributeTable, ReadSource, WriteTarget};
use crate::ble::AttributeHandle;
use crate::error::{Error, Result};

/// Attribute operation requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessOp {
    /// Read a characteristic value.
    ReadCharacteristic,
    /// Write a characteristic value.
    WriteCharacteristic,
    /// Read a descriptor.
    ReadDescriptor,
    /// Write a descriptor.
    WriteDescriptor,
}

impl AccessOp {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadCharacteristic => "read characteristic",
            Self::WriteCharacteristic => "write characteristic",
            Self::ReadDescriptor => "read descriptor",
            Self::WriteDescriptor => "write descriptor",
        }
    }

    /// Check if this is a read.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::ReadCharacteristic | Self::ReadDescriptor)
    }

    /// Check if this targets a descriptor.
    pub fn is_descriptor(&self) -> bool {
        matches!(self, Self::ReadDescriptor | Self::WriteDescriptor)
    }
}

impl fmt::Display for AccessOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bounded buffer holding a read response.
#[derive(Debug)]
pub struct OutboundBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl OutboundBuffer {
    /// Create a buffer that holds at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes still free.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Append`] if `data` does not fit. Nothing is written.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining() {
            return Err(Error::Append {
                needed: data.len(),
                available: self.remaining(),
            });
        }
        self.buf.put_slice(data);
        Ok(())
    }

    /// Finish and return the contents.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Shared state read by handlers.
#[derive(Debug, Clone, Copy)]
pub struct AccessContext<'a> {
    /// Current battery level.
    pub battery_level: u8,
    /// Current subscription configurations.
    pub subscriptions: &'a SubscriptionManager,
}

/// What the caller must do after a successful access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessEffect {
    /// Nothing.
    None,
    /// Apply `config` to `characteristic` and re-derive its producer state.
    Subscription {
        /// Value handle of the characteristic.
        characteristic: AttributeHandle,
        /// Configuration to apply.
        config: ClientConfig,
    },
    /// Forward an incoming message.
    Message(Bytes),
}

/// Dispatches accesses against a registered table.
#[derive(Debug, Clone, Copy)]
pub struct AccessDispatcher<'a> {
    table: &'a AttributeTable,
}

impl<'a> AccessDispatcher<'a> {
    /// Dispatch against `table`.
    pub fn new(table: &'a AttributeTable) -> Self {
        Self { table }
    }

    /// Handle one access.
    ///
    /// Reads append their value to `out`. A descriptor read or write of a
    /// client configuration always yields [`AccessEffect::Subscription`], so
    /// the producer state is resynchronized on every access.
    ///
    /// # Errors
    ///
    /// * [`Error::UnknownAttribute`] if nothing is registered under `attr`
    /// * [`Error::AccessDenied`] if the attribute does not support `op`
    /// * [`Error::Append`] if the value does not fit in `out`
    pub fn dispatch(
        &self,
        op: AccessOp,
        attr: AttributeHandle,
        payload: &[u8],
        ctx: &AccessContext<'_>,
        out: &mut OutboundBuffer,
    ) -> Result<AccessEffect> {
        let entry = self
            .table
            .get(attr)
            .ok_or(Error::UnknownAttribute { handle: attr.0 })?;

        let denied = Error::AccessDenied {
            handle: attr.0,
            operation: op.name(),
        };

        let owner = match entry.kind {
            AttributeKind::Characteristic if !op.is_descriptor() => attr,
            AttributeKind::Descriptor { owner } if op.is_descriptor() => owner,
            _ => return Err(denied),
        };

        trace!("{} on {} ({} bytes in)", op, attr, payload.len());

        if op.is_read() {
            if !entry.properties.is_readable() {
                return Err(denied);
            }
            match entry.behavior.read_source() {
                Some(ReadSource::Static(value)) => {
                    out.append(value)?;
                    Ok(AccessEffect::None)
                }
                Some(ReadSource::BatteryLevel) => {
                    out.append(&[ctx.battery_level])?;
                    Ok(AccessEffect::None)
                }
                Some(ReadSource::ClientConfig) => {
                    let config = ctx
                        .subscriptions
                        .config(owner)
                        .ok_or(Error::UnknownAttribute { handle: owner.0 })?;
                    out.append(&config.to_bytes())?;
                    Ok(AccessEffect::Subscription {
                        characteristic: owner,
                        config,
                    })
                }
                None => Err(denied),
            }
        } else {
            if !entry.properties.is_writable() {
                return Err(denied);
            }
            match entry.behavior.write_target() {
                Some(WriteTarget::MessageSink) => {
                    Ok(AccessEffect::Message(Bytes::copy_from_slice(payload)))
                }
                Some(WriteTarget::ClientConfig) => {
                    let current = ctx
                        .subscriptions
                        .config(owner)
                        .ok_or(Error::UnknownAttribute { handle: owner.0 })?;
                    let config = current.written(payload);
                    debug!(
                        "Client configuration of {} written: {:02x?}",
                        owner,
                        config.to_bytes()
                    );
                    Ok(AccessEffect::Subscription {
                        characteristic: owner,
                        config,
                    })
                }
                None => Err(denied),
            }
        }
    }
}
