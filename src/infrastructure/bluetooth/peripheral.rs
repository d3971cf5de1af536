//! Peripheral Session
//!
//! Wraps one physical connection. Service handlers register their service
//! identifier here and GATT callbacks are routed to them by that identifier.
//! Failures that are not tied to a handler come back to the owner as a
//! [`PeripheralOutcome`].

use crate::domain::models::PeripheralErrorKind;
use crate::infrastructure::bluetooth::scheduler::{Scheduler, TimerKind, TimerSlot};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicRef, GattEvent, PeripheralId, Transport, TransportError, WriteType,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace};
use uuid::Uuid;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Startup progress of a service handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    DiscoveringService,
    DiscoveringCharacteristic,
    EnablingNotifications,
    Ready,
    /// Torn down but still waiting for the device to acknowledge.
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{0} service is not ready")]
    NotReady(&'static str),
    #[error("{0} characteristic has not been discovered")]
    NoCharacteristic(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A handle to one connection instance of a peripheral.
///
/// Every reconnect produces a new instance; handlers compare instances to
/// make sure they never talk through a stale link.
#[derive(Clone)]
pub struct PeripheralLink {
    transport: Arc<dyn Transport>,
    id: PeripheralId,
    instance: u64,
}

impl fmt::Debug for PeripheralLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralLink")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .finish()
    }
}

impl PeripheralLink {
    pub fn new(transport: Arc<dyn Transport>, id: PeripheralId) -> Self {
        Self {
            transport,
            id,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected(&self.id)
    }

    pub fn discover_services(&self, services: &[Uuid]) -> Result<(), TransportError> {
        self.guarded("discover services", || {
            self.transport.discover_services(&self.id, Some(services))
        })
    }

    pub fn discover_characteristics(
        &self,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<(), TransportError> {
        self.guarded("discover characteristics", || {
            self.transport
                .discover_characteristics(&self.id, service, Some(characteristics))
        })
    }

    pub fn set_notify(
        &self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.guarded("change notify value", || {
            self.transport.set_notify(&self.id, characteristic, enabled)
        })
    }

    pub fn write(
        &self,
        characteristic: &CharacteristicRef,
        bytes: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        self.guarded("write", || {
            self.transport
                .write(&self.id, characteristic, bytes, write_type)
        })
    }

    pub fn read_value(&self, characteristic: &CharacteristicRef) -> Result<(), TransportError> {
        self.guarded("read value", || {
            self.transport.read_value(&self.id, characteristic)
        })
    }

    pub fn read_rssi(&self) -> Result<(), TransportError> {
        self.guarded("read rssi", || self.transport.read_rssi(&self.id))
    }

    /// Only forward requests while the link is up.
    fn guarded(
        &self,
        operation: &'static str,
        request: impl FnOnce() -> Result<(), TransportError>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            debug!(
                "Peripheral({}): trying to {} on a non connected peripheral",
                self.id.short(),
                operation
            );
            return Err(TransportError::NotConnected(self.id.clone()));
        }

        request().inspect_err(|e| {
            error!(
                "Peripheral({}): failed to {}: {}",
                self.id.short(),
                operation,
                e
            );
        })
    }
}

/// Callbacks a service handler receives from its peripheral
pub trait GattService {
    /// Identifier of the wrapped service.
    fn service_uuid(&self) -> Uuid;

    fn handle_service_discovered(&mut self);

    fn handle_characteristics_discovered(&mut self, characteristics: &[Uuid]);

    fn handle_notify_state(&mut self, characteristic: Uuid, notifying: bool);

    /// A notification or read reply on one of the service's characteristics.
    fn handle_data(&mut self, characteristic: Uuid, bytes: &[u8]);
}

/// What the owner of a peripheral session has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralOutcome {
    Rssi(i16),
    Error {
        kind: PeripheralErrorKind,
        error: TransportError,
    },
}

pub struct PeripheralSession {
    link: PeripheralLink,
    registered: HashSet<Uuid>,
    rssi_poll: TimerSlot,
    rssi_interval: Option<Duration>,
}

impl PeripheralSession {
    pub fn new(link: PeripheralLink) -> Self {
        Self {
            link,
            registered: HashSet::new(),
            rssi_poll: TimerSlot::new(),
            rssi_interval: None,
        }
    }

    pub fn link(&self) -> &PeripheralLink {
        &self.link
    }

    pub fn register(&mut self, service: Uuid) {
        self.registered.insert(service);
    }

    /// Handlers must be registered again before they receive anything.
    pub fn clear_services(&mut self) {
        self.registered.clear();
    }

    pub fn is_registered(&self, service: &Uuid) -> bool {
        self.registered.contains(service)
    }

    /// Poll RSSI every `interval`. No-op when already polling.
    pub fn start_reading_rssi(&mut self, scheduler: &Scheduler, interval: Duration) {
        if self.rssi_interval.is_some() {
            return;
        }
        if !self.link.is_connected() {
            debug!(
                "Peripheral({}): not polling rssi on a non connected peripheral",
                self.link.id.short()
            );
            return;
        }

        self.rssi_interval = Some(interval);
        self.poll_rssi(scheduler);
    }

    pub fn stop_reading_rssi(&mut self) {
        self.rssi_interval = None;
        self.rssi_poll.cancel();
    }

    pub fn is_reading_rssi(&self) -> bool {
        self.rssi_interval.is_some()
    }

    pub fn on_rssi_timer(&mut self, scheduler: &Scheduler, id: u64) {
        if self.rssi_poll.fire(id) {
            self.poll_rssi(scheduler);
        }
    }

    fn poll_rssi(&mut self, scheduler: &Scheduler) {
        let Some(interval) = self.rssi_interval else {
            return;
        };
        if !self.link.is_connected() {
            self.rssi_interval = None;
            return;
        }

        let _ = self.link.read_rssi();
        self.rssi_poll
            .arm(scheduler.schedule(&self.link.id, TimerKind::RssiPoll, interval));
    }

    /// Route a GATT callback to the registered handler owning its service.
    pub fn dispatch(
        &self,
        event: GattEvent,
        handlers: &mut [&mut dyn GattService],
    ) -> Option<PeripheralOutcome> {
        let short = self.link.id.short();
        match event {
            GattEvent::RssiRead(Ok(rssi)) => Some(PeripheralOutcome::Rssi(rssi)),
            GattEvent::RssiRead(Err(error)) => {
                error!("Peripheral({}): error reading RSSI: {}", short, error);
                Some(PeripheralOutcome::Error {
                    kind: PeripheralErrorKind::ReadRssi,
                    error,
                })
            }
            GattEvent::ServicesDiscovered(Err(error)) => {
                error!("Peripheral({}): failed to discover services: {}", short, error);
                Some(PeripheralOutcome::Error {
                    kind: PeripheralErrorKind::DiscoverServices,
                    error,
                })
            }
            GattEvent::ServicesDiscovered(Ok(services)) => {
                for service in services {
                    match self.handler_for(service, handlers) {
                        Some(handler) => handler.handle_service_discovered(),
                        None => debug!("Peripheral({}): unknown service discovered: {}", short, service),
                    }
                }
                None
            }
            GattEvent::CharacteristicsDiscovered { service, result } => match result {
                Err(error) => {
                    error!(
                        "Peripheral({}): failed to discover characteristics for service '{}': {}",
                        short, service, error
                    );
                    Some(PeripheralOutcome::Error {
                        kind: PeripheralErrorKind::DiscoverCharacteristics,
                        error,
                    })
                }
                Ok(characteristics) => {
                    match self.handler_for(service, handlers) {
                        Some(handler) => handler.handle_characteristics_discovered(&characteristics),
                        None => debug!(
                            "Peripheral({}): characteristics discovered for unknown service: {}",
                            short, service
                        ),
                    }
                    None
                }
            },
            GattEvent::NotifyStateChanged {
                characteristic,
                result,
            } => match result {
                Err(error) => {
                    error!(
                        "Peripheral({}): failed to update notification state for characteristic '{}': {}",
                        short, characteristic.uuid, error
                    );
                    Some(PeripheralOutcome::Error {
                        kind: PeripheralErrorKind::UpdateNotificationState,
                        error,
                    })
                }
                Ok(notifying) => {
                    match self.handler_for(characteristic.service, handlers) {
                        Some(handler) => handler.handle_notify_state(characteristic.uuid, notifying),
                        None => debug!(
                            "Peripheral({}): notify value updated for unknown service: {}",
                            short, characteristic.service
                        ),
                    }
                    None
                }
            },
            GattEvent::ValueUpdated {
                characteristic,
                result,
            } => match result {
                Err(error) => {
                    error!(
                        "Peripheral({}): failed to update value for characteristic '{}': {}",
                        short, characteristic.uuid, error
                    );
                    Some(PeripheralOutcome::Error {
                        kind: PeripheralErrorKind::UpdateValue,
                        error,
                    })
                }
                Ok(bytes) => {
                    match self.handler_for(characteristic.service, handlers) {
                        Some(handler) => handler.handle_data(characteristic.uuid, &bytes),
                        None => trace!(
                            "Peripheral({}): unknown service '{}' sending data: {:?}",
                            short, characteristic.service, bytes
                        ),
                    }
                    None
                }
            },
        }
    }

    fn handler_for<'a, 'h>(
        &self,
        service: Uuid,
        handlers: &'a mut [&'h mut dyn GattService],
    ) -> Option<&'a mut &'h mut dyn GattService> {
        if !self.registered.contains(&service) {
            return None;
        }
        handlers.iter_mut().find(|h| h.service_uuid() == service)
    }
}
