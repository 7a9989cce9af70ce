//! BLE connection and advertising state.
//!
//! Owns the single live connection and decides when advertising must be
//! (re)started in response to link-layer events.

use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Opaque connection handle assigned by the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u16);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute handle assigned by the host stack at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeHandle(pub u16);

impl std::fmt::Display for AttributeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Connection state of the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Neither advertising nor connected.
    #[default]
    Idle,
    /// Advertising and waiting for a client.
    Advertising,
    /// Connected to a client.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if advertising.
    pub fn is_advertising(&self) -> bool {
        matches!(self, Self::Advertising)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Advertising => write!(f, "Advertising"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// The live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    /// Handle assigned by the host stack.
    pub handle: ConnectionHandle,
    /// When the connect event was processed.
    pub established_at: Instant,
}

/// Link-layer events delivered by the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapEvent {
    /// A connection attempt completed. `status` is 0 on success.
    Connect {
        /// Host status code.
        status: i32,
        /// Handle of the new connection (meaningless on failure).
        handle: ConnectionHandle,
    },
    /// The connection was terminated.
    Disconnect {
        /// Handle of the terminated connection.
        handle: ConnectionHandle,
        /// Host reason code.
        reason: i32,
    },
    /// The advertising window elapsed or was ended.
    AdvertiseComplete {
        /// Host reason code.
        reason: i32,
    },
    /// The client changed its subscription through the native mechanism.
    Subscribe {
        /// Connection the subscription belongs to.
        handle: ConnectionHandle,
        /// Value handle of the characteristic.
        attr_handle: AttributeHandle,
        /// Whether notifications are now enabled.
        notify: bool,
        /// Whether indications are now enabled.
        indicate: bool,
    },
}

impl GapEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::AdvertiseComplete { .. } => "advertise complete",
            Self::Subscribe { .. } => "subscribe",
        }
    }
}

/// Work the peripheral must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapAction {
    /// (Re)start advertising.
    StartAdvertising,
    /// A connection was established; set up per-connection state.
    OpenSession(ConnectionHandle),
    /// The connection ended; tear down per-connection state.
    CloseSession(ConnectionHandle),
    /// Forward a native subscription change.
    Subscribe {
        /// Value handle of the characteristic.
        attr_handle: AttributeHandle,
        /// Client configuration bytes equivalent to the subscription.
        config: [u8; 2],
    },
}

/// Connection/advertising state machine.
///
/// `Idle -> Advertising -> Connected -> Advertising -> ...`, cycling forever.
#[derive(Debug, Default)]
pub struct GapMachine {
    state: ConnectionState,
    connection: Option<Connection>,
}

impl GapMachine {
    /// Create a machine in the `Idle` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the live connection, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Get the live connection handle, if any.
    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        self.connection.map(|c| c.handle)
    }

    /// Resolve `handle` against the live connection.
    pub fn check_handle(&self, handle: ConnectionHandle) -> Result<Connection> {
        match self.connection {
            Some(conn) if conn.handle == handle => Ok(conn),
            _ => Err(Error::StaleHandle { handle: handle.0 }),
        }
    }

    /// The host stack became ready.
    pub fn on_sync(&mut self) -> Vec<GapAction> {
        if self.state != ConnectionState::Idle {
            debug!("Sync while {}, nothing to do", self.state);
            return Vec::new();
        }
        vec![GapAction::StartAdvertising]
    }

    /// Record that advertising was started.
    pub fn advertising_started(&mut self) {
        if self.connection.is_none() {
            self.set_state(ConnectionState::Advertising);
        }
    }

    /// Record that advertising could not be started.
    pub fn advertising_failed(&mut self) {
        if self.connection.is_none() {
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Apply a link-layer event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleHandle`] when the event refers to a connection
    /// that is not the live one. The state is left untouched.
    pub fn handle(&mut self, event: &GapEvent) -> Result<Vec<GapAction>> {
        match *event {
            GapEvent::Connect { status, handle } if status == 0 => {
                if let Some(existing) = self.connection {
                    warn!(
                        "Connect on {} while connection {} is live, ignoring",
                        handle, existing.handle
                    );
                    return Ok(Vec::new());
                }
                info!("Client connected on handle {}", handle);
                self.connection = Some(Connection {
                    handle,
                    established_at: Instant::now(),
                });
                self.set_state(ConnectionState::Connected);
                Ok(vec![GapAction::OpenSession(handle)])
            }
            GapEvent::Connect { status, .. } => {
                warn!("Connection attempt failed with status {}", status);
                if self.connection.is_some() {
                    return Ok(Vec::new());
                }
                self.set_state(ConnectionState::Idle);
                Ok(vec![GapAction::StartAdvertising])
            }
            GapEvent::Disconnect { handle, reason } => {
                let conn = self.check_handle(handle)?;
                info!(
                    "Client disconnected from handle {} (reason {}) after {:?}",
                    handle,
                    reason,
                    conn.established_at.elapsed()
                );
                self.connection = None;
                self.set_state(ConnectionState::Idle);
                Ok(vec![
                    GapAction::CloseSession(handle),
                    GapAction::StartAdvertising,
                ])
            }
            GapEvent::AdvertiseComplete { reason } => {
                if self.connection.is_some() {
                    debug!("Advertising complete (reason {}) while connected", reason);
                    return Ok(Vec::new());
                }
                debug!("Advertising complete (reason {}), restarting", reason);
                self.set_state(ConnectionState::Idle);
                Ok(vec![GapAction::StartAdvertising])
            }
            GapEvent::Subscribe {
                handle,
                attr_handle,
                notify,
                indicate,
            } => {
                self.check_handle(handle)?;
                let config = [u8::from(notify) | (u8::from(indicate) << 1), 0];
                Ok(vec![GapAction::Subscribe {
                    attr_handle,
                    config,
                }])
            }
        }
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        if self.state != new_state {
            debug!("GAP state changed: {} -> {}", self.state, new_state);
            self.state = new_state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: ConnectionHandle = ConnectionHandle(1);

    fn connected() -> GapMachine {
        let mut gap = GapMachine::new();
        gap.on_sync();
        gap.advertising_started();
        gap.handle(&GapEvent::Connect {
            status: 0,
            handle: CONN,
        })
        .unwrap();
        gap
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Idle.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Advertising.is_advertising());
        assert!(!ConnectionState::Connected.is_advertising());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Advertising), "Advertising");
        assert_eq!(format!("{}", AttributeHandle(0x12)), "0x0012");
    }

    #[test]
    fn test_sync_starts_advertising_once() {
        let mut gap = GapMachine::new();
        assert_eq!(gap.on_sync(), vec![GapAction::StartAdvertising]);
        gap.advertising_started();
        assert_eq!(gap.state(), ConnectionState::Advertising);
        assert!(gap.on_sync().is_empty());
    }

    #[test]
    fn test_connect_records_handle() {
        let gap = connected();
        assert_eq!(gap.state(), ConnectionState::Connected);
        assert_eq!(gap.connection_handle(), Some(CONN));
    }

    #[test]
    fn test_connect_failure_readvertises() {
        let mut gap = GapMachine::new();
        gap.on_sync();
        gap.advertising_started();
        let actions = gap
            .handle(&GapEvent::Connect {
                status: 13,
                handle: CONN,
            })
            .unwrap();
        assert_eq!(actions, vec![GapAction::StartAdvertising]);
        assert_eq!(gap.connection_handle(), None);
        assert_ne!(gap.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_clears_handle() {
        let mut gap = connected();
        let actions = gap
            .handle(&GapEvent::Disconnect {
                handle: CONN,
                reason: 0x13,
            })
            .unwrap();
        assert_eq!(
            actions,
            vec![GapAction::CloseSession(CONN), GapAction::StartAdvertising]
        );
        assert_eq!(gap.connection_handle(), None);
        assert!(gap.check_handle(CONN).is_err());
        gap.advertising_started();
        assert_eq!(gap.state(), ConnectionState::Advertising);
    }

    #[test]
    fn test_disconnect_of_unknown_handle_is_stale() {
        let mut gap = connected();
        let result = gap.handle(&GapEvent::Disconnect {
            handle: ConnectionHandle(7),
            reason: 0,
        });
        assert!(matches!(result, Err(Error::StaleHandle { handle: 7 })));
        assert_eq!(gap.connection_handle(), Some(CONN));
    }

    #[test]
    fn test_advertise_complete_restarts_unless_connected() {
        let mut gap = GapMachine::new();
        gap.on_sync();
        gap.advertising_started();
        assert_eq!(
            gap.handle(&GapEvent::AdvertiseComplete { reason: 0 })
                .unwrap(),
            vec![GapAction::StartAdvertising]
        );

        let mut gap = connected();
        assert!(gap
            .handle(&GapEvent::AdvertiseComplete { reason: 0 })
            .unwrap()
            .is_empty());
        assert_eq!(gap.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_second_connect_is_ignored() {
        let mut gap = connected();
        let actions = gap
            .handle(&GapEvent::Connect {
                status: 0,
                handle: ConnectionHandle(2),
            })
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(gap.connection_handle(), Some(CONN));
    }

    #[test]
    fn test_subscribe_folds_into_config() {
        let mut gap = connected();
        let actions = gap
            .handle(&GapEvent::Subscribe {
                handle: CONN,
                attr_handle: AttributeHandle(9),
                notify: true,
                indicate: false,
            })
            .unwrap();
        assert_eq!(
            actions,
            vec![GapAction::Subscribe {
                attr_handle: AttributeHandle(9),
                config: [0x01, 0x00],
            }]
        );

        let actions = gap
            .handle(&GapEvent::Subscribe {
                handle: CONN,
                attr_handle: AttributeHandle(9),
                notify: false,
                indicate: true,
            })
            .unwrap();
        assert_eq!(
            actions,
            vec![GapAction::Subscribe {
                attr_handle: AttributeHandle(9),
                config: [0x02, 0x00],
            }]
        );
    }

    #[test]
    fn test_subscribe_without_connection_is_stale() {
        let mut gap = GapMachine::new();
        let result = gap.handle(&GapEvent::Subscribe {
            handle: CONN,
            attr_handle: AttributeHandle(9),
            notify: true,
            indicate: false,
        });
        assert!(matches!(result, Err(Error::StaleHandle { .. })));
    }
}
