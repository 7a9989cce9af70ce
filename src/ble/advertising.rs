//! Advertising data construction.
//!
//! Builds the legacy advertising payload announced while no client is
//! connected. Fields are rebuilt every time advertising (re)starts.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Maximum length of a legacy advertising payload.
pub const MAX_ADV_PAYLOAD_LEN: usize = 31;

/// AD type: Flags.
const AD_TYPE_FLAGS: u8 = 0x01;
/// AD type: Complete Local Name.
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
/// AD type: Shortened Local Name.
const AD_TYPE_SHORT_NAME: u8 = 0x08;
/// AD type: TX Power Level.
const AD_TYPE_TX_POWER: u8 = 0x0A;

/// Discoverability flags carried in the Flags AD structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdFlags(u8);

impl AdFlags {
    /// LE Limited Discoverable Mode.
    pub const LIMITED_DISCOVERABLE: Self = Self(0x01);
    /// LE General Discoverable Mode.
    pub const GENERAL_DISCOVERABLE: Self = Self(0x02);
    /// BR/EDR Not Supported.
    pub const BREDR_UNSUPPORTED: Self = Self(0x04);

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        self.0
    }

    /// Check if every bit of `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AdFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// TX power level advertised in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TxPowerLevel {
    /// Let the host fill in the controller's current level.
    #[default]
    Auto,
    /// A fixed level in dBm.
    Dbm(i8),
}

/// Local address type used when advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AddressType {
    /// Public device address.
    #[default]
    Public = 0,
    /// Static random device address.
    Random = 1,
    /// Resolvable private address with public identity.
    RpaPublic = 2,
    /// Resolvable private address with random identity.
    RpaRandom = 3,
}

/// Connectability of the advertising set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectMode {
    /// Not connectable.
    NonConnectable,
    /// Directed connectable.
    Directed,
    /// Undirected connectable.
    #[default]
    Undirected,
}

/// Discoverability of the advertising set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DiscoverMode {
    /// Not discoverable.
    NonDiscoverable,
    /// Limited discoverable.
    Limited,
    /// General discoverable.
    #[default]
    General,
}

/// How long an advertising session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdvertisingDuration {
    /// Advertise until a connection is made or advertising is stopped.
    #[default]
    Forever,
    /// Advertise for a bounded number of milliseconds.
    Millis(u32),
}

/// Parameters passed to the host when starting advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvertisingParams {
    /// Connectability.
    pub connect_mode: ConnectMode,
    /// Discoverability.
    pub discover_mode: DiscoverMode,
    /// Session duration.
    pub duration: AdvertisingDuration,
}

impl AdvertisingParams {
    /// Undirected connectable, general discoverable, forever.
    pub fn connectable() -> Self {
        Self::default()
    }
}

/// Fields of the legacy advertising payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingFields {
    /// Discoverability flags.
    pub flags: AdFlags,
    /// Advertised TX power, if present.
    pub tx_power: Option<TxPowerLevel>,
    /// Local name.
    pub name: String,
    /// Whether the name is complete or shortened.
    pub name_is_complete: bool,
}

impl AdvertisingFields {
    /// Build the advertising fields announced by this device.
    ///
    /// General and limited discoverable flags, automatic TX power and
    /// the complete device name.
    pub fn for_device(name: &str) -> Self {
        Self {
            flags: AdFlags::GENERAL_DISCOVERABLE | AdFlags::LIMITED_DISCOVERABLE,
            tx_power: Some(TxPowerLevel::Auto),
            name: name.to_string(),
            name_is_complete: true,
        }
    }

    /// Length in bytes of the encoded payload.
    pub fn encoded_len(&self) -> usize {
        let mut len = 3;
        if self.tx_power.is_some() {
            len += 3;
        }
        if !self.name.is_empty() {
            len += 2 + self.name.len();
        }
        len
    }

    /// Check the payload fits in a legacy advertising PDU.
    pub fn validate(&self) -> Result<()> {
        let len = self.encoded_len();
        if len > MAX_ADV_PAYLOAD_LEN {
            return Err(Error::InvalidParameter {
                name: "advertising payload".to_string(),
                value: format!("{} bytes (max {})", len, MAX_ADV_PAYLOAD_LEN),
            });
        }
        Ok(())
    }

    /// Encode as a sequence of AD structures.
    ///
    /// # Arguments
    ///
    /// * `resolved_tx_power` - Level written when the TX power is `Auto`
    pub fn encode(&self, resolved_tx_power: i8) -> Result<Bytes> {
        self.validate()?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());

        buf.put_u8(2);
        buf.put_u8(AD_TYPE_FLAGS);
        buf.put_u8(self.flags.to_raw());

        if let Some(tx_power) = self.tx_power {
            let level = match tx_power {
                TxPowerLevel::Auto => resolved_tx_power,
                TxPowerLevel::Dbm(dbm) => dbm,
            };
            buf.put_u8(2);
            buf.put_u8(AD_TYPE_TX_POWER);
            buf.put_i8(level);
        }

        if !self.name.is_empty() {
            buf.put_u8((self.name.len() + 1) as u8);
            buf.put_u8(if self.name_is_complete {
                AD_TYPE_COMPLETE_NAME
            } else {
                AD_TYPE_SHORT_NAME
            });
            buf.put_slice(self.name.as_bytes());
        }

        Ok(buf.freeze())
    }
}
