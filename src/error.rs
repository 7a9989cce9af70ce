//! Error types for the hartman-sight-ble crate.

use thiserror::Error;

use crate::host::HostError;

/// ATT error codes surfaced to the host for a failed attribute access.
pub mod att {
    /// The attribute handle given was not valid on this server.
    pub const INVALID_HANDLE: u8 = 0x01;
    /// The attribute cannot be read.
    pub const READ_NOT_PERMITTED: u8 = 0x02;
    /// The attribute cannot be written.
    pub const WRITE_NOT_PERMITTED: u8 = 0x03;
    /// The request could not be completed for an unlikely reason.
    pub const UNLIKELY_ERROR: u8 = 0x0E;
    /// Insufficient resources to complete the request.
    pub const INSUFFICIENT_RESOURCES: u8 = 0x11;
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Hardware, storage or first advertising bring-up failed. The process cannot start.
    #[error("Initialization failed during {stage}: {source}")]
    FatalInit {
        /// The bring-up step that failed.
        stage: &'static str,
        /// The underlying host error.
        #[source]
        source: HostError,
    },

    /// The host rejected the attribute table layout.
    #[error("Attribute table rejected: {reason}")]
    Registration {
        /// Why the layout was rejected.
        reason: String,
    },

    /// An advertising or connection attempt failed. Recovered by re-advertising.
    #[error("Transient link error: {0}")]
    TransientLink(#[source] HostError),

    /// An operation referenced a connection that is no longer live.
    #[error("Stale connection handle {handle}")]
    StaleHandle {
        /// The handle the operation carried.
        handle: u16,
    },

    /// Appending a value to the outbound buffer failed.
    #[error("Outbound buffer exhausted: {needed} bytes needed, {available} available")]
    Append {
        /// Bytes the handler tried to append.
        needed: usize,
        /// Bytes still free in the buffer.
        available: usize,
    },

    /// No attribute is registered under the handle.
    #[error("Unknown attribute handle {handle}")]
    UnknownAttribute {
        /// The attribute handle that was accessed.
        handle: u16,
    },

    /// The operation is not permitted by the attribute's capabilities.
    #[error("Operation {operation} not permitted on attribute {handle}")]
    AccessDenied {
        /// The attribute handle that was accessed.
        handle: u16,
        /// The denied operation.
        operation: &'static str,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

impl Error {
    /// Whether the error must abort process start.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalInit { .. } | Self::Registration { .. })
    }

    /// The status byte handed back to the host for a failed GATT access.
    pub fn att_status(&self) -> u8 {
        match self {
            Self::UnknownAttribute { .. } => att::INVALID_HANDLE,
            Self::AccessDenied { operation, .. } if operation.starts_with("read") => {
                att::READ_NOT_PERMITTED
            }
            Self::AccessDenied { .. } => att::WRITE_NOT_PERMITTED,
            Self::Append { .. } => att::INSUFFICIENT_RESOURCES,
            _ => att::UNLIKELY_ERROR,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
