//! The peripheral.
//!
//! [`Peripheral`] is the explicit context object every host callback goes
//! through. It owns the GAP state machine, the subscription state, the
//! battery counter and the running notification producers, all behind a
//! single lock shared by the host event context and the timer context.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::ble::uuids::BATTERY_LEVEL_UUID;
use crate::ble::{
    AddressType, AdvertisingFields, AdvertisingParams, AttributeHandle, ConnectionHandle,
    ConnectionState, GapAction, GapEvent, GapMachine,
};
use crate::config::PeripheralConfig;
use crate::error::{Error, Result};
use crate::gatt::{
    device_services, AccessContext, AccessDispatcher, AccessEffect, AccessOp, AttributeTable,
    BatteryLevel, ClientConfig, OutboundBuffer, SubscriptionManager,
};
use crate::host::{HostError, HostStack, Platform};

/// Capacity of the incoming message channel.
const MESSAGE_CHANNEL_CAPACITY: usize = 64;

/// A write received on the custom message characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Connection the write arrived on.
    pub connection: ConnectionHandle,
    /// Raw payload.
    pub payload: Bytes,
    /// When the write was processed.
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    /// Payload as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Mutable state shared by the event and timer contexts.
struct SharedState {
    gap: GapMachine,
    subscriptions: SubscriptionManager,
    battery: BatteryLevel,
    producers: HashMap<AttributeHandle, Producer>,
    producer_generation: u64,
    address_type: Option<AddressType>,
    restart_attempts: u32,
    pending_restart: Option<JoinHandle<()>>,
}

/// A spawned producer timer. Ticks from an older generation are dropped.
struct Producer {
    generation: u64,
    task: JoinHandle<()>,
}

struct Inner {
    host: Arc<dyn HostStack>,
    config: PeripheralConfig,
    table: AttributeTable,
    battery_level_handle: AttributeHandle,
    state: Mutex<SharedState>,
    messages: broadcast::Sender<IncomingMessage>,
}

/// BLE peripheral core.
///
/// Cheap to clone; every clone drives the same device.
#[derive(Clone)]
pub struct Peripheral {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("device_name", &self.inner.config.device_name)
            .field("battery_level_handle", &self.inner.battery_level_handle)
            .finish_non_exhaustive()
    }
}

impl Peripheral {
    /// Bring up the platform and register the device with the host.
    ///
    /// Runs storage init, controller init, device naming and service
    /// registration in that order. Advertising starts later, from
    /// [`Peripheral::on_sync`].
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidParameter`] if `config` is invalid
    /// * [`Error::FatalInit`] if a bring-up step fails
    /// * [`Error::Registration`] if the host rejects the attribute table
    pub async fn bring_up(
        platform: &dyn Platform,
        host: Arc<dyn HostStack>,
        config: PeripheralConfig,
    ) -> Result<Self> {
        config.validate()?;

        platform
            .init_storage()
            .await
            .map_err(|source| Error::FatalInit {
                stage: "storage",
                source,
            })?;
        debug!("Storage initialized");

        platform
            .init_controller()
            .await
            .map_err(|source| Error::FatalInit {
                stage: "controller",
                source,
            })?;
        debug!("Controller initialized");

        Self::register(host, config)
    }

    /// Name the device and register its services with an already running host.
    ///
    /// # Errors
    ///
    /// See [`Peripheral::bring_up`].
    pub fn register(host: Arc<dyn HostStack>, config: PeripheralConfig) -> Result<Self> {
        config.validate()?;

        host.set_device_name(&config.device_name)
            .map_err(|source| Error::FatalInit {
                stage: "device name",
                source,
            })?;

        let table = AttributeTable::register(&device_services(&config), host.as_ref())?;
        let battery_level_handle =
            table
                .value_handle(&BATTERY_LEVEL_UUID)
                .ok_or_else(|| Error::Registration {
                    reason: "battery level characteristic missing".to_string(),
                })?;

        let state = SharedState {
            gap: GapMachine::new(),
            subscriptions: SubscriptionManager::new(table.notifiable()),
            battery: BatteryLevel::new(config.battery_start),
            producers: HashMap::new(),
            producer_generation: 0,
            address_type: None,
            restart_attempts: 0,
            pending_restart: None,
        };
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);

        info!(
            "Registered {} ({} attributes), waiting for host sync",
            config.device_name,
            table.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                host,
                config,
                table,
                battery_level_handle,
                state: Mutex::new(state),
                messages,
            }),
        })
    }

    /// The host stack is synchronized. Starts advertising.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FatalInit`] if the address type cannot be inferred
    /// or advertising cannot be started.
    pub fn on_sync(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.gap.on_sync().is_empty() {
            return Ok(());
        }

        let address_type =
            self.inner
                .host
                .infer_address_type()
                .map_err(|source| Error::FatalInit {
                    stage: "address inference",
                    source,
                })?;
        state.address_type = Some(address_type);

        if let Err(source) = self.try_start_advertising(&mut state) {
            state.gap.advertising_failed();
            return Err(Error::FatalInit {
                stage: "advertising",
                source,
            });
        }
        state.gap.advertising_started();
        info!(
            "Advertising as {} ({:?} address)",
            self.inner.config.device_name, address_type
        );
        Ok(())
    }

    /// Handle a link-layer event from the host.
    ///
    /// Events that reference a connection other than the live one are
    /// logged and ignored.
    pub fn handle_gap_event(&self, event: GapEvent) {
        let mut state = self.inner.state.lock();
        trace!("GAP event: {:?}", event);

        let actions = match state.gap.handle(&event) {
            Ok(actions) => actions,
            Err(e) => {
                debug!("Ignoring {} event: {}", event.name(), e);
                return;
            }
        };

        for action in actions {
            match action {
                GapAction::StartAdvertising => self.restart_advertising(&mut state),
                GapAction::OpenSession(handle) => self.open_session(&mut state, handle),
                GapAction::CloseSession(handle) => self.close_session(&mut state, handle),
                GapAction::Subscribe {
                    attr_handle,
                    config,
                } => {
                    let config = ClientConfig::from_bytes(config);
                    if let Err(e) = self.set_subscription(&mut state, attr_handle, config) {
                        warn!("Subscribe to {} rejected: {}", attr_handle, e);
                    }
                }
            }
        }
    }

    /// Handle a client read or write.
    ///
    /// Returns the read response (empty for writes).
    ///
    /// # Errors
    ///
    /// * [`Error::StaleHandle`] if `conn` is not the live connection
    /// * [`Error::UnknownAttribute`], [`Error::AccessDenied`] or
    ///   [`Error::Append`] from dispatch
    pub fn handle_access(
        &self,
        conn: ConnectionHandle,
        attr: AttributeHandle,
        op: AccessOp,
        payload: &[u8],
    ) -> Result<Bytes> {
        let mut state = self.inner.state.lock();
        state.gap.check_handle(conn)?;

        let mut out = OutboundBuffer::new(self.inner.config.attribute_capacity);
        let effect = {
            let ctx = AccessContext {
                battery_level: state.battery.current(),
                subscriptions: &state.subscriptions,
            };
            AccessDispatcher::new(&self.inner.table).dispatch(op, attr, payload, &ctx, &mut out)?
        };

        match effect {
            AccessEffect::None => {}
            AccessEffect::Subscription {
                characteristic,
                config,
            } => {
                self.set_subscription(&mut state, characteristic, config)?;
            }
            AccessEffect::Message(payload) => {
                info!("Incoming message: {}", String::from_utf8_lossy(&payload));
                // No receivers is fine.
                let _ = self.inner.messages.send(IncomingMessage {
                    connection: conn,
                    payload,
                    received_at: Utc::now(),
                });
            }
        }

        Ok(out.freeze())
    }

    /// Handle a client access and reduce the outcome to an ATT status.
    ///
    /// Returns `(0, response)` on success and `(status, empty)` on failure.
    pub fn access_status(
        &self,
        conn: ConnectionHandle,
        attr: AttributeHandle,
        op: AccessOp,
        payload: &[u8],
    ) -> (u8, Bytes) {
        match self.handle_access(conn, attr, op, payload) {
            Ok(response) => (0, response),
            Err(e) => {
                match e {
                    Error::StaleHandle { .. } => debug!("Ignoring {} on {}: {}", op, attr, e),
                    _ => warn!("{} on {} failed: {}", op, attr, e),
                }
                (e.att_status(), Bytes::new())
            }
        }
    }

    /// One producer tick for `characteristic`.
    ///
    /// Advances the value and notifies the live connection. Returns the
    /// payload that was sent, or `None` if the producer is disarmed, no
    /// client is connected or the host refused the notification.
    pub fn on_timer_tick(&self, characteristic: AttributeHandle) -> Option<Bytes> {
        let mut state = self.inner.state.lock();
        self.tick(&mut state, characteristic)
    }

    /// A tick from the timer spawned for `generation`.
    fn producer_tick(&self, characteristic: AttributeHandle, generation: u64) -> Option<Bytes> {
        let mut state = self.inner.state.lock();
        let current = state.producers.get(&characteristic).map(|p| p.generation);
        if current != Some(generation) {
            trace!(
                "Dropping tick of replaced producer for {} (generation {})",
                characteristic,
                generation
            );
            return None;
        }
        self.tick(&mut state, characteristic)
    }

    fn tick(&self, state: &mut SharedState, characteristic: AttributeHandle) -> Option<Bytes> {
        if !state.subscriptions.is_armed(characteristic) {
            trace!("Producer for {} disarmed, skipping tick", characteristic);
            return None;
        }
        let Some(conn) = state.gap.connection_handle() else {
            debug!("No connection, skipping notification on {}", characteristic);
            return None;
        };
        if characteristic != self.inner.battery_level_handle {
            return None;
        }

        let level = state.battery.next();
        debug!("Reporting battery level {}%", level);
        let payload = Bytes::copy_from_slice(&[level]);

        match self.inner.host.notify(conn, characteristic, &payload) {
            Ok(()) => Some(payload),
            Err(e) => {
                warn!("Notification on {} failed: {}", characteristic, Error::TransientLink(e));
                None
            }
        }
    }

    /// Current GAP state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().gap.state()
    }

    /// Handle of the live connection.
    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        self.inner.state.lock().gap.connection_handle()
    }

    /// Check if the producer for `characteristic` is armed.
    pub fn is_producer_armed(&self, characteristic: AttributeHandle) -> bool {
        self.inner.state.lock().subscriptions.is_armed(characteristic)
    }

    /// Current client configuration of `characteristic`.
    pub fn client_config(&self, characteristic: AttributeHandle) -> Option<[u8; 2]> {
        self.inner
            .state
            .lock()
            .subscriptions
            .config(characteristic)
            .map(|c| c.to_bytes())
    }

    /// Current battery level.
    pub fn battery_level(&self) -> u8 {
        self.inner.state.lock().battery.current()
    }

    /// Value handle of the Battery Level characteristic.
    pub fn battery_level_handle(&self) -> AttributeHandle {
        self.inner.battery_level_handle
    }

    /// The registered attribute table.
    pub fn table(&self) -> &AttributeTable {
        &self.inner.table
    }

    /// The active configuration.
    pub fn config(&self) -> &PeripheralConfig {
        &self.inner.config
    }

    /// Subscribe to incoming custom-service writes.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<IncomingMessage> {
        self.inner.messages.subscribe()
    }

    /// Stop every background task.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        for characteristic in state.subscriptions.reset_all() {
            debug!("Stopping producer for {}", characteristic);
        }
        for (_, producer) in state.producers.drain() {
            producer.task.abort();
        }
        if let Some(task) = state.pending_restart.take() {
            task.abort();
        }
        info!("Peripheral shut down");
    }

    fn open_session(&self, state: &mut SharedState, _handle: ConnectionHandle) {
        if let Some(task) = state.pending_restart.take() {
            task.abort();
        }
        state.restart_attempts = 0;

        self.disarm_all(state);
        if self.inner.config.notifications_enabled_on_connect {
            for characteristic in self.inner.table.notifiable() {
                if let Err(e) = self.set_subscription(state, characteristic, ClientConfig::NOTIFY) {
                    warn!("Default subscription of {} failed: {}", characteristic, e);
                }
            }
        }
    }

    fn close_session(&self, state: &mut SharedState, handle: ConnectionHandle) {
        let disarmed = self.disarm_all(state);
        if disarmed > 0 {
            info!("Stopped {} producer(s) for connection {}", disarmed, handle);
        }
    }

    /// Reset every subscription and stop every producer.
    fn disarm_all(&self, state: &mut SharedState) -> usize {
        let was_armed = state.subscriptions.reset_all();
        for (_, producer) in state.producers.drain() {
            producer.task.abort();
        }
        was_armed.len()
    }

    /// The single entry point for subscription changes.
    ///
    /// Stores `config`, re-derives the enabled flag and (re)arms or disarms
    /// the producer to match. Returns whether notifications are enabled.
    fn set_subscription(
        &self,
        state: &mut SharedState,
        characteristic: AttributeHandle,
        config: ClientConfig,
    ) -> Result<bool> {
        let enabled = state.subscriptions.apply(characteristic, config)?;
        if enabled {
            self.arm_producer(state, characteristic);
        } else if let Some(producer) = state.producers.remove(&characteristic) {
            producer.task.abort();
        }
        Ok(enabled)
    }

    fn arm_producer(&self, state: &mut SharedState, characteristic: AttributeHandle) {
        // An aborted task may already be waiting on the lock; its
        // generation no longer matches once it gets there.
        if let Some(producer) = state.producers.remove(&characteristic) {
            producer.task.abort();
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!(
                    "No runtime, producer for {} armed without a timer",
                    characteristic
                );
                return;
            }
        };

        state.producer_generation += 1;
        let generation = state.producer_generation;
        let period = self.inner.config.notify_period;
        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Peripheral { inner }.producer_tick(characteristic, generation);
            }
        });
        state
            .producers
            .insert(characteristic, Producer { generation, task });
    }

    fn try_start_advertising(&self, state: &mut SharedState) -> std::result::Result<(), HostError> {
        let host = &self.inner.host;
        let address_type = match state.address_type {
            Some(address_type) => address_type,
            None => {
                let address_type = host.infer_address_type()?;
                state.address_type = Some(address_type);
                address_type
            }
        };

        let fields = AdvertisingFields::for_device(&self.inner.config.device_name);
        host.set_advertising_fields(&fields)?;
        host.start_advertising(address_type, &AdvertisingParams::connectable())
    }

    /// Restart advertising at runtime, retrying with backoff on failure.
    fn restart_advertising(&self, state: &mut SharedState) {
        if let Some(task) = state.pending_restart.take() {
            task.abort();
        }

        match self.try_start_advertising(state) {
            Ok(()) => {
                state.restart_attempts = 0;
                state.gap.advertising_started();
                debug!("Advertising restarted");
            }
            Err(e) => {
                state.gap.advertising_failed();
                state.restart_attempts = state.restart_attempts.saturating_add(1);
                let policy = self.inner.config.restart;
                warn!(
                    "Advertising restart attempt {} failed: {}",
                    state.restart_attempts,
                    Error::TransientLink(e)
                );

                // Past the backoff budget keep retrying at the slowest rate.
                let delay = if state.restart_attempts >= policy.max_attempts {
                    if state.restart_attempts == policy.max_attempts {
                        error!(
                            "Advertising still failing after {} attempts, retrying every {:?}",
                            state.restart_attempts, policy.max_delay
                        );
                    }
                    policy.max_delay
                } else {
                    policy.delay_for(state.restart_attempts - 1)
                };

                let runtime = match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => runtime,
                    Err(_) => {
                        warn!(
                            "No runtime to schedule an advertising retry, call retry_advertising"
                        );
                        return;
                    }
                };

                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                state.pending_restart = Some(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        Peripheral { inner }.retry_advertising();
                    }
                }));
            }
        }
    }

    /// Retry advertising if it is not running and no client is connected.
    ///
    /// Retries are scheduled automatically on a tokio runtime. Without one,
    /// the embedding loop drives them through this call.
    pub fn retry_advertising(&self) {
        let mut state = self.inner.state.lock();
        // Detach the pending task so restart_advertising doesn't abort it.
        state.pending_restart = None;
        if state.gap.state() == ConnectionState::Idle && state.gap.connection().is_none() {
            self.restart_advertising(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertising::AdFlags;
    use crate::config::RestartPolicy;
    use crate::error::att;
    use crate::host::{
        CharacteristicHandles, HostCall, MockHostStack, MockPlatform, SimulatedHost,
        SimulatedPlatform,
    };
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::time::Duration;

    const CONN: ConnectionHandle = ConnectionHandle(1);
    const MANUFACTURER: AttributeHandle = AttributeHandle(3);
    const LEVEL: AttributeHandle = AttributeHandle(8);
    const LEVEL_CCCD: AttributeHandle = AttributeHandle(9);
    const MESSAGE: AttributeHandle = AttributeHandle(12);

    fn setup_with(config: PeripheralConfig) -> (Peripheral, Arc<SimulatedHost>) {
        let host = Arc::new(SimulatedHost::new());
        let peripheral = Peripheral::register(host.clone(), config).unwrap();
        peripheral.on_sync().unwrap();
        (peripheral, host)
    }

    fn setup() -> (Peripheral, Arc<SimulatedHost>) {
        setup_with(PeripheralConfig::default())
    }

    fn connect(peripheral: &Peripheral, handle: ConnectionHandle) {
        peripheral.handle_gap_event(GapEvent::Connect { status: 0, handle });
    }

    fn disconnect(peripheral: &Peripheral, handle: ConnectionHandle) {
        peripheral.handle_gap_event(GapEvent::Disconnect {
            handle,
            reason: 0x13,
        });
    }

    fn write_cccd(peripheral: &Peripheral, bytes: &[u8]) -> Result<Bytes> {
        peripheral.handle_access(CONN, LEVEL_CCCD, AccessOp::WriteDescriptor, bytes)
    }

    #[test]
    fn test_power_on_advertises() {
        let (peripheral, host) = setup();

        assert_eq!(peripheral.state(), ConnectionState::Advertising);
        assert_eq!(peripheral.battery_level_handle(), LEVEL);

        let calls = host.calls();
        assert_eq!(calls[0], HostCall::SetDeviceName("HARTMAN_SIGHT".to_string()));
        assert_eq!(calls[1], HostCall::RegisterServices(3));
        assert_eq!(calls[2], HostCall::InferAddressType);

        let fields = match &calls[3] {
            HostCall::SetAdvertisingFields(fields) => fields.clone(),
            other => panic!("unexpected call {:?}", other),
        };
        assert_eq!(fields.name, "HARTMAN_SIGHT");
        assert!(fields.flags.contains(AdFlags::GENERAL_DISCOVERABLE));
        assert!(fields.flags.contains(AdFlags::LIMITED_DISCOVERABLE));
        assert_eq!(calls[4], HostCall::StartAdvertising(AddressType::Public));

        let data = host.advertising_data().unwrap();
        assert_eq!(&data[..6], &[0x02, 0x01, 0x03, 0x02, 0x0A, 0x00]);
        assert_eq!(&data[6..8], &[14, 0x09]);
        assert_eq!(&data[8..], b"HARTMAN_SIGHT");
    }

    #[test]
    fn test_sync_twice_is_noop() {
        let (peripheral, host) = setup();
        peripheral.on_sync().unwrap();
        assert_eq!(host.advertising_starts(), 1);
    }

    #[test]
    fn test_sync_failure_is_fatal() {
        let host = Arc::new(SimulatedHost::new());
        host.fail_next_advertising_starts(1);
        let peripheral = Peripheral::register(host.clone(), PeripheralConfig::default()).unwrap();

        let err = peripheral.on_sync().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::FatalInit {
                stage: "advertising",
                ..
            }
        ));
        assert_eq!(peripheral.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_name_rejection_is_fatal() {
        let host = Arc::new(SimulatedHost::new().with_name_rejected());
        let err = Peripheral::register(host, PeripheralConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::FatalInit {
                stage: "device name",
                ..
            }
        ));
    }

    #[test]
    fn test_registration_rejection() {
        let host = Arc::new(SimulatedHost::new().with_max_attributes(8));
        let err = Peripheral::register(host, PeripheralConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[test]
    fn test_cccd_write_arms_and_tick_notifies() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        assert_eq!(peripheral.state(), ConnectionState::Connected);
        assert_eq!(peripheral.connection_handle(), Some(CONN));
        assert!(!peripheral.is_producer_armed(LEVEL));

        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();
        assert!(peripheral.is_producer_armed(LEVEL));

        let sent = peripheral.on_timer_tick(LEVEL).unwrap();
        assert_eq!(sent.as_ref(), &[99]);
        assert_eq!(host.notifications(), vec![(CONN, LEVEL, vec![99])]);
    }

    #[test]
    fn test_native_subscribe_arms_like_cccd_write() {
        let (via_write, _) = setup();
        connect(&via_write, CONN);
        write_cccd(&via_write, &[0x01, 0x00]).unwrap();

        let (via_subscribe, _) = setup();
        connect(&via_subscribe, CONN);
        via_subscribe.handle_gap_event(GapEvent::Subscribe {
            handle: CONN,
            attr_handle: LEVEL,
            notify: true,
            indicate: false,
        });

        assert!(via_subscribe.is_producer_armed(LEVEL));
        assert_eq!(
            via_write.client_config(LEVEL),
            via_subscribe.client_config(LEVEL)
        );

        // CCCD read reflects the native subscription.
        let value = via_subscribe
            .handle_access(CONN, LEVEL_CCCD, AccessOp::ReadDescriptor, &[])
            .unwrap();
        assert_eq!(value.as_ref(), &[0x01, 0x00]);
    }

    #[test]
    fn test_unsubscribe_disarms() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();
        peripheral.handle_gap_event(GapEvent::Subscribe {
            handle: CONN,
            attr_handle: LEVEL,
            notify: false,
            indicate: false,
        });

        assert!(!peripheral.is_producer_armed(LEVEL));
        assert!(peripheral.on_timer_tick(LEVEL).is_none());
        assert!(host.notifications().is_empty());
    }

    #[test]
    fn test_disconnect_disarms_and_readvertises() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();

        disconnect(&peripheral, CONN);

        assert!(!peripheral.is_producer_armed(LEVEL));
        assert_eq!(peripheral.client_config(LEVEL), Some([0x00, 0x00]));
        assert_eq!(peripheral.connection_handle(), None);
        assert_eq!(peripheral.state(), ConnectionState::Advertising);
        assert_eq!(host.advertising_starts(), 2);

        assert!(peripheral.on_timer_tick(LEVEL).is_none());
        assert!(host.notifications().is_empty());
        assert_eq!(peripheral.battery_level(), 100);
    }

    #[test]
    fn test_connect_failure_readvertises() {
        let (peripheral, host) = setup();
        peripheral.handle_gap_event(GapEvent::Connect {
            status: 0x3E,
            handle: CONN,
        });
        assert_eq!(peripheral.state(), ConnectionState::Advertising);
        assert_eq!(peripheral.connection_handle(), None);
        assert_eq!(host.advertising_starts(), 2);
    }

    #[test]
    fn test_advertise_complete() {
        let (peripheral, host) = setup();
        peripheral.handle_gap_event(GapEvent::AdvertiseComplete { reason: 0 });
        assert_eq!(host.advertising_starts(), 2);

        connect(&peripheral, CONN);
        peripheral.handle_gap_event(GapEvent::AdvertiseComplete { reason: 0 });
        assert_eq!(host.advertising_starts(), 2);
        assert_eq!(peripheral.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_stale_handles_ignored() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        let other = ConnectionHandle(7);

        let err = peripheral
            .handle_access(other, MANUFACTURER, AccessOp::ReadCharacteristic, &[])
            .unwrap_err();
        assert!(matches!(err, Error::StaleHandle { handle: 7 }));

        peripheral.handle_gap_event(GapEvent::Subscribe {
            handle: other,
            attr_handle: LEVEL,
            notify: true,
            indicate: false,
        });
        assert!(!peripheral.is_producer_armed(LEVEL));

        disconnect(&peripheral, other);
        assert_eq!(peripheral.state(), ConnectionState::Connected);

        disconnect(&peripheral, CONN);
        let (status, _) =
            peripheral.access_status(CONN, MANUFACTURER, AccessOp::ReadCharacteristic, &[]);
        assert_eq!(status, att::UNLIKELY_ERROR);
        assert_eq!(host.advertising_starts(), 2);
    }

    #[test]
    fn test_second_connect_ignored() {
        let (peripheral, _) = setup();
        connect(&peripheral, CONN);
        connect(&peripheral, ConnectionHandle(2));
        assert_eq!(peripheral.connection_handle(), Some(CONN));
    }

    #[test]
    fn test_reads() {
        let (peripheral, _) = setup();
        connect(&peripheral, CONN);

        let (status, value) =
            peripheral.access_status(CONN, MANUFACTURER, AccessOp::ReadCharacteristic, &[]);
        assert_eq!(status, 0);
        assert_eq!(value.as_ref(), b"PARAS DEFENSE");

        let value = peripheral
            .handle_access(CONN, LEVEL, AccessOp::ReadCharacteristic, &[])
            .unwrap();
        assert_eq!(value.as_ref(), &[100]);

        let (status, _) = peripheral.access_status(CONN, MESSAGE, AccessOp::ReadCharacteristic, &[]);
        assert_eq!(status, att::READ_NOT_PERMITTED);
    }

    #[test]
    fn test_incoming_message_forwarded() {
        let (peripheral, _) = setup();
        let mut rx = peripheral.subscribe_messages();
        connect(&peripheral, CONN);

        let response = peripheral
            .handle_access(CONN, MESSAGE, AccessOp::WriteCharacteristic, b"hello")
            .unwrap();
        assert!(response.is_empty());

        let message = rx.try_recv().unwrap();
        assert_eq!(message.connection, CONN);
        assert_eq!(message.text(), "hello");
    }

    #[test]
    fn test_short_cccd_write_keeps_trailing_byte() {
        let (peripheral, _) = setup();
        connect(&peripheral, CONN);

        write_cccd(&peripheral, &[0x01, 0x02]).unwrap();
        write_cccd(&peripheral, &[0x00]).unwrap();
        assert_eq!(peripheral.client_config(LEVEL), Some([0x00, 0x02]));
        assert!(!peripheral.is_producer_armed(LEVEL));

        write_cccd(&peripheral, &[]).unwrap();
        assert_eq!(peripheral.client_config(LEVEL), Some([0x00, 0x02]));
    }

    #[test]
    fn test_notifications_enabled_on_connect() {
        let config = PeripheralConfig::default().with_notifications_enabled_on_connect(true);
        let (peripheral, host) = setup_with(config);
        assert!(!peripheral.is_producer_armed(LEVEL));

        connect(&peripheral, CONN);
        assert!(peripheral.is_producer_armed(LEVEL));
        assert_eq!(peripheral.client_config(LEVEL), Some([0x01, 0x00]));

        peripheral.on_timer_tick(LEVEL);
        assert_eq!(host.notifications().len(), 1);
    }

    #[test]
    fn test_failed_notification_not_reported() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();

        host.set_notifications_failing(true);
        assert!(peripheral.on_timer_tick(LEVEL).is_none());
        assert!(peripheral.is_producer_armed(LEVEL));
    }

    #[test]
    fn test_notify_through_mock_host() {
        let mut host = MockHostStack::new();
        host.expect_set_device_name().returning(|_| Ok(()));
        host.expect_register_services().returning(|_| {
            Ok(vec![
                CharacteristicHandles {
                    value_handle: AttributeHandle(0x10),
                    descriptor_handles: vec![],
                },
                CharacteristicHandles {
                    value_handle: AttributeHandle(0x20),
                    descriptor_handles: vec![],
                },
                CharacteristicHandles {
                    value_handle: AttributeHandle(0x30),
                    descriptor_handles: vec![AttributeHandle(0x31)],
                },
                CharacteristicHandles {
                    value_handle: AttributeHandle(0x40),
                    descriptor_handles: vec![],
                },
            ])
        });
        host.expect_infer_address_type()
            .times(1)
            .returning(|| Ok(AddressType::Random));
        host.expect_set_advertising_fields().returning(|_| Ok(()));
        host.expect_start_advertising()
            .withf(|addr, _| *addr == AddressType::Random)
            .times(1)
            .returning(|_, _| Ok(()));
        host.expect_notify()
            .withf(|conn, attr, data| {
                *conn == ConnectionHandle(4)
                    && *attr == AttributeHandle(0x30)
                    && data.to_vec() == vec![99u8]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let peripheral =
            Peripheral::register(Arc::new(host), PeripheralConfig::default()).unwrap();
        peripheral.on_sync().unwrap();
        connect(&peripheral, ConnectionHandle(4));
        peripheral
            .handle_access(
                ConnectionHandle(4),
                AttributeHandle(0x31),
                AccessOp::WriteDescriptor,
                &[0x01, 0x00],
            )
            .unwrap();

        assert_eq!(
            peripheral.on_timer_tick(AttributeHandle(0x30)).as_deref(),
            Some(&[99u8][..])
        );
    }

    #[tokio::test]
    async fn test_bring_up_failures() {
        let mut platform = MockPlatform::new();
        platform.expect_init_storage().times(1).returning(|| Ok(()));
        platform
            .expect_init_controller()
            .times(1)
            .returning(|| Err(HostError::new(3)));

        let host = Arc::new(SimulatedHost::new());
        let err = Peripheral::bring_up(&platform, host.clone(), PeripheralConfig::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Initialization failed during controller: Host stack returned error code 3"
        );
        assert!(host.calls().is_empty());

        let platform = SimulatedPlatform {
            storage_error: Some(HostError::new(1)),
            controller_error: None,
        };
        let err = Peripheral::bring_up(&platform, host, PeripheralConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FatalInit { stage: "storage", .. }));
    }

    #[tokio::test]
    async fn test_bring_up() {
        let host = Arc::new(SimulatedHost::new());
        let peripheral = tokio_test::assert_ok!(
            Peripheral::bring_up(&SimulatedPlatform::new(), host, PeripheralConfig::default())
                .await
        );
        assert_eq!(peripheral.state(), ConnectionState::Idle);
        tokio_test::assert_ok!(peripheral.on_sync());
        assert_eq!(peripheral.state(), ConnectionState::Advertising);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_ticks_every_period() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(host.notifications().is_empty());

        tokio::time::sleep(Duration::from_millis(3000)).await;
        let levels: Vec<u8> = host.notifications().into_iter().map(|(_, _, d)| d[0]).collect();
        assert_eq!(levels, vec![99, 98, 97]);

        disconnect(&peripheral, CONN);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(host.notifications().len(), 3);
        peripheral.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_rearms_timer() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        // Enabling again restarts the period.
        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(host.notifications().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(host.notifications().len(), 1);
        peripheral.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_producer_tick_dropped() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);
        let generation = |peripheral: &Peripheral| {
            let state = peripheral.inner.state.lock();
            state.producers.get(&LEVEL).map(|producer| producer.generation)
        };

        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();
        let old = generation(&peripheral).unwrap();
        write_cccd(&peripheral, &[0x01, 0x00]).unwrap();
        let new = generation(&peripheral).unwrap();
        assert_ne!(old, new);

        // A tick from the aborted task that already reached the lock.
        assert_eq!(peripheral.producer_tick(LEVEL, old), None);
        assert!(host.notifications().is_empty());

        assert!(peripheral.producer_tick(LEVEL, new).is_some());
        assert_eq!(host.notifications().len(), 1);

        // Disabling drops every generation.
        write_cccd(&peripheral, &[0x00, 0x00]).unwrap();
        assert_eq!(generation(&peripheral), None);
        assert_eq!(peripheral.producer_tick(LEVEL, new), None);
        assert_eq!(host.notifications().len(), 1);
        peripheral.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertising_retry_with_backoff() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);

        host.fail_next_advertising_starts(2);
        disconnect(&peripheral, CONN);
        assert_eq!(peripheral.state(), ConnectionState::Idle);
        assert_eq!(host.advertising_starts(), 2);

        // First retry after 100 ms, fails.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(host.advertising_starts(), 3);
        assert_eq!(peripheral.state(), ConnectionState::Idle);

        // Second retry 200 ms later, succeeds.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(host.advertising_starts(), 4);
        assert_eq!(peripheral.state(), ConnectionState::Advertising);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertising_retry_settles_at_max_delay() {
        let config = PeripheralConfig::default().with_restart_policy(RestartPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        });
        let (peripheral, host) = setup_with(config);

        host.fail_next_advertising_starts(10);
        peripheral.handle_gap_event(GapEvent::AdvertiseComplete { reason: 0 });

        // Failures at 0, 100 ms and 300 ms, then one per second.
        tokio::time::sleep(Duration::from_millis(2350)).await;
        assert_eq!(host.advertising_starts(), 1 + 5);
        assert_eq!(peripheral.state(), ConnectionState::Idle);

        // The tenth failure lands at 7.3 s, the next start succeeds.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(host.advertising_starts(), 1 + 11);
        assert_eq!(peripheral.state(), ConnectionState::Advertising);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertising_resumes_after_host_recovers() {
        let (peripheral, host) = setup();
        connect(&peripheral, CONN);

        host.fail_next_advertising_starts(5);
        disconnect(&peripheral, CONN);
        assert_eq!(peripheral.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        // Initial start, five failures, then the retry at max delay.
        assert_eq!(host.advertising_starts(), 1 + 5 + 1);
        assert_eq!(peripheral.state(), ConnectionState::Advertising);

        connect(&peripheral, CONN);
        assert_eq!(peripheral.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_retry_driven_by_hand_without_runtime() {
        let (peripheral, host) = setup();
        host.fail_next_advertising_starts(1);
        peripheral.handle_gap_event(GapEvent::AdvertiseComplete { reason: 0 });
        assert_eq!(peripheral.state(), ConnectionState::Idle);

        peripheral.retry_advertising();
        assert_eq!(host.advertising_starts(), 3);
        assert_eq!(peripheral.state(), ConnectionState::Advertising);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Connect,
        Disconnect,
        WriteCccd(Vec<u8>),
        Subscribe(bool),
        Tick,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Connect),
            Just(Step::Disconnect),
            prop::collection::vec(any::<u8>(), 0..4).prop_map(Step::WriteCccd),
            any::<bool>().prop_map(Step::Subscribe),
            Just(Step::Tick),
        ]
    }

    proptest! {
        #[test]
        fn producer_follows_config_and_stops_on_disconnect(steps in prop::collection::vec(step(), 1..40)) {
            let (peripheral, host) = setup();
            let mut expected_level = 100u8;

            for step in steps {
                match step {
                    Step::Connect => connect(&peripheral, CONN),
                    Step::Disconnect => {
                        disconnect(&peripheral, CONN);
                        prop_assert!(!peripheral.is_producer_armed(LEVEL));
                        prop_assert_eq!(peripheral.client_config(LEVEL), Some([0, 0]));
                    }
                    Step::WriteCccd(bytes) => {
                        let _ = write_cccd(&peripheral, &bytes);
                    }
                    Step::Subscribe(notify) => peripheral.handle_gap_event(GapEvent::Subscribe {
                        handle: CONN,
                        attr_handle: LEVEL,
                        notify,
                        indicate: false,
                    }),
                    Step::Tick => {
                        let connected = peripheral.connection_handle().is_some();
                        let armed = peripheral.is_producer_armed(LEVEL);
                        let sent = peripheral.on_timer_tick(LEVEL);
                        prop_assert_eq!(sent.is_some(), connected && armed);
                        if let Some(sent) = sent {
                            expected_level = if expected_level == 0 { 100 } else { expected_level - 1 };
                            prop_assert_eq!(sent[0], expected_level);
                        }
                    }
                }

                let config = peripheral.client_config(LEVEL).unwrap_or_default();
                prop_assert_eq!(peripheral.is_producer_armed(LEVEL), config[0] & 0x01 == 0x01);
            }

            prop_assert!(host
                .notifications()
                .iter()
                .all(|(conn, attr, _)| *conn == CONN && *attr == LEVEL));
        }

        #[test]
        fn cccd_write_reads_back(bytes in any::<[u8; 2]>()) {
            let (peripheral, _) = setup();
            connect(&peripheral, CONN);
            write_cccd(&peripheral, &bytes).unwrap();
            let read = peripheral
                .handle_access(CONN, LEVEL_CCCD, AccessOp::ReadDescriptor, &[])
                .unwrap();
            prop_assert_eq!(read.as_ref(), &bytes[..]);
            prop_assert_eq!(peripheral.is_producer_armed(LEVEL), bytes[0] & 0x01 == 0x01);
        }
    }
}
